//! On-disk format of the local index.
//!
//! `index.bin` (little endian):
//!
//! ```text
//! magic "BKIX" | version u32 | kind u8 | metric u8 | dim u32 | count u32
//! count * dim f32 vectors
//! structure: flat  -> nothing
//!            ivf   -> nlist u32, nlist * dim f32 centroids, per list: len u32 + slots
//!            graph -> entry u32 (u32::MAX when empty), per node: len u32 + neighbours
//! ```
//!
//! `index.meta.json` holds the document records and the id -> slot map.
//! Both files are written to a temp name and renamed into place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use basket_core::config::{LocalIndexKind, Metric};
use basket_core::error::{Error, Result};
use basket_core::types::IndexedDocument;

use super::ann::{to_u32, AnnStructure, Graph, Ivf};
use super::LocalState;

pub const INDEX_FILE: &str = "index.bin";
pub const META_FILE: &str = "index.meta.json";
const MAGIC: &[u8; 4] = b"BKIX";
const VERSION: u32 = 1;
const NO_ENTRY: u32 = u32::MAX;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideCar {
    pub documents: BTreeMap<String, IndexedDocument>,
    pub id_to_slot: BTreeMap<String, usize>,
    #[serde(default)]
    pub saved_at: Option<String>,
}

/// Header and payload read back from `index.bin`.
#[derive(Debug)]
pub struct Decoded {
    pub kind: LocalIndexKind,
    pub metric: Metric,
    pub dim: usize,
    pub vectors: Vec<Vec<f32>>,
    pub structure: AnnStructure,
}

fn kind_code(kind: LocalIndexKind) -> u8 {
    match kind {
        LocalIndexKind::Flat => 0,
        LocalIndexKind::Ivf => 1,
        LocalIndexKind::Graph => 2,
    }
}

fn metric_code(metric: Metric) -> u8 {
    match metric {
        Metric::Cosine => 0,
        Metric::Euclidean => 1,
    }
}

struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }
    fn f32s(&mut self, v: &[f32]) {
        for x in v {
            self.0.extend_from_slice(&x.to_le_bytes());
        }
    }
    fn slots(&mut self, v: &[u32]) {
        self.u32(to_u32(v.len()));
        for s in v {
            self.u32(*s);
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end =
            self.pos.checked_add(n).filter(|&e| e <= self.buf.len()).ok_or_else(|| corrupt("unexpected end of file"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }
    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn len(&mut self) -> Result<usize> {
        Ok(self.u32()? as usize)
    }
    fn f32s(&mut self, n: usize) -> Result<Vec<f32>> {
        let b = self.take(n.checked_mul(4).ok_or_else(|| corrupt("length overflow"))?)?;
        Ok(b.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
    }
    fn slots(&mut self, bound: usize) -> Result<Vec<u32>> {
        let n = self.len()?;
        let out = (0..n).map(|_| self.u32()).collect::<Result<Vec<u32>>>()?;
        if out.iter().any(|&s| s as usize >= bound) {
            return Err(corrupt("slot out of range"));
        }
        Ok(out)
    }
}

fn corrupt(msg: &str) -> Error {
    Error::unavailable(format!("corrupt local index: {msg}"))
}

pub fn encode_index(state: &LocalState, metric: Metric, dim: usize) -> Vec<u8> {
    let mut w = Writer(Vec::with_capacity(20 + state.vectors.len() * dim * 4));
    w.0.extend_from_slice(MAGIC);
    w.u32(VERSION);
    w.u8(kind_code(state.structure.kind()));
    w.u8(metric_code(metric));
    w.u32(to_u32(dim));
    w.u32(to_u32(state.vectors.len()));
    for v in &state.vectors {
        w.f32s(v);
    }
    match &state.structure {
        AnnStructure::Flat => {}
        AnnStructure::Ivf(ivf) => {
            w.u32(to_u32(ivf.centroids.len()));
            for c in &ivf.centroids {
                w.f32s(c);
            }
            for list in &ivf.lists {
                w.slots(list);
            }
        }
        AnnStructure::Graph(g) => {
            w.u32(g.entry.unwrap_or(NO_ENTRY));
            for n in &g.neighbors {
                w.slots(n);
            }
        }
    }
    w.0
}

pub fn decode_index(buf: &[u8]) -> Result<Decoded> {
    let mut r = Reader { buf, pos: 0 };
    if r.take(4)? != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(corrupt(&format!("unsupported version {version}")));
    }
    let kind = match r.u8()? {
        0 => LocalIndexKind::Flat,
        1 => LocalIndexKind::Ivf,
        2 => LocalIndexKind::Graph,
        other => return Err(corrupt(&format!("unknown kind {other}"))),
    };
    let metric = match r.u8()? {
        0 => Metric::Cosine,
        1 => Metric::Euclidean,
        other => return Err(corrupt(&format!("unknown metric {other}"))),
    };
    let dim = r.len()?;
    let count = r.len()?;
    let vectors = (0..count).map(|_| r.f32s(dim)).collect::<Result<Vec<_>>>()?;
    let structure = match kind {
        LocalIndexKind::Flat => AnnStructure::Flat,
        LocalIndexKind::Ivf => {
            let nlist = r.len()?;
            let centroids = (0..nlist).map(|_| r.f32s(dim)).collect::<Result<Vec<_>>>()?;
            let lists = (0..nlist).map(|_| r.slots(count)).collect::<Result<Vec<_>>>()?;
            AnnStructure::Ivf(Ivf { centroids, lists })
        }
        LocalIndexKind::Graph => {
            let entry = match r.u32()? {
                NO_ENTRY => None,
                e if (e as usize) < count => Some(e),
                _ => return Err(corrupt("graph entry out of range")),
            };
            let neighbors = (0..count).map(|_| r.slots(count)).collect::<Result<Vec<_>>>()?;
            AnnStructure::Graph(Graph { neighbors, entry })
        }
    };
    Ok(Decoded { kind, metric, dim, vectors, structure })
}

pub fn side_car(state: &LocalState) -> SideCar {
    SideCar {
        documents: state.documents.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        id_to_slot: state.id_to_slot.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        saved_at: Some(chrono::Utc::now().to_rfc3339()),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub async fn save(dir: &Path, index: Vec<u8>, side_car: &SideCar) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let meta = serde_json::to_vec_pretty(side_car)?;
    write_atomic(&dir.join(INDEX_FILE), &index).await?;
    write_atomic(&dir.join(META_FILE), &meta).await
}

/// `None` when no index has been saved in `dir` yet.
pub async fn load(dir: &Path) -> Result<Option<(Decoded, SideCar)>> {
    let index_path = dir.join(INDEX_FILE);
    let meta_path = dir.join(META_FILE);
    if !tokio::fs::try_exists(&index_path).await? || !tokio::fs::try_exists(&meta_path).await? {
        return Ok(None);
    }
    let decoded = decode_index(&tokio::fs::read(&index_path).await?)?;
    let side_car: SideCar = serde_json::from_slice(&tokio::fs::read(&meta_path).await?)?;
    if side_car.id_to_slot.len() != decoded.vectors.len() {
        return Err(corrupt("side-car and index disagree on document count"));
    }
    Ok(Some((decoded, side_car)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_files_are_rejected() {
        let state = LocalState::default();
        let bytes = encode_index(&state, Metric::Cosine, 3);
        assert!(decode_index(&bytes).is_ok());
        assert!(decode_index(&bytes[..bytes.len() - 1]).is_err());
        assert!(decode_index(b"NOPE").is_err());
    }

    #[test]
    fn structure_survives_encoding() {
        let mut state = LocalState::default();
        state.vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.6, 0.8]];
        state.structure = AnnStructure::Graph(Graph { neighbors: vec![vec![1, 2], vec![0], vec![0]], entry: Some(0) });
        let decoded = decode_index(&encode_index(&state, Metric::Euclidean, 2)).expect("decode");
        assert_eq!(decoded.kind, LocalIndexKind::Graph);
        assert_eq!(decoded.metric, Metric::Euclidean);
        assert_eq!(decoded.vectors, state.vectors);
        assert_eq!(decoded.structure, state.structure);
    }
}
