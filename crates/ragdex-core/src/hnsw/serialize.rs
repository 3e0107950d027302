use std::io::{self, Read, Write};

use super::node::Node;
use super::Hnsw;
use crate::distance::Metric;

/// Magic bytes identifying a persisted graph: "RAGDXG01"
const GRAPH_MAGIC: [u8; 8] = *b"RAGDXG01";

const NO_ENTRY: u32 = u32::MAX;

impl Hnsw {
    /// Serialize the adjacency lists.
    ///
    /// Slots are rewritten through `remap` so the file addresses records by
    /// their position in the vector file rather than by in-memory slot.
    ///
    /// Format (all integers little endian):
    /// - Magic "RAGDXG01"
    /// - NumNodes u32, EntryPoint u32 (u32::MAX if none), MaxLayer u8,
    ///   M u32, M0 u32, EfConstruction u32
    /// - Per node: Slot u32, TopLayer u8, then per layer
    ///   NeighborCount u32 + Neighbors [u32]
    pub fn serialize<W, F>(&self, writer: &mut W, remap: F) -> io::Result<()>
    where
        W: Write,
        F: Fn(usize) -> Option<u32>,
    {
        let map = |slot: usize| {
            remap(slot).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("graph references unmapped slot {slot}"),
                )
            })
        };

        writer.write_all(&GRAPH_MAGIC)?;
        writer.write_all(&(self.nodes.len() as u32).to_le_bytes())?;
        let entry = match self.entry_point {
            Some(slot) => map(slot)?,
            None => NO_ENTRY,
        };
        writer.write_all(&entry.to_le_bytes())?;
        writer.write_all(&[self.max_layer as u8])?;
        writer.write_all(&(self.m as u32).to_le_bytes())?;
        writer.write_all(&(self.m0 as u32).to_le_bytes())?;
        writer.write_all(&(self.ef_construction as u32).to_le_bytes())?;

        for node in &self.nodes {
            writer.write_all(&map(node.slot)?.to_le_bytes())?;
            writer.write_all(&[node.top_layer() as u8])?;
            for links in &node.links {
                writer.write_all(&(links.len() as u32).to_le_bytes())?;
                for &neighbor in links {
                    writer.write_all(&map(neighbor)?.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Read a graph written by [`Hnsw::serialize`]. Every slot must be below
    /// `slot_count`, the number of vectors the graph indexes.
    pub fn deserialize<R: Read>(
        reader: &mut R,
        metric: Metric,
        slot_count: usize,
        seed: u64,
    ) -> io::Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != GRAPH_MAGIC {
            return Err(invalid("invalid graph magic"));
        }

        let num_nodes = read_u32(reader)? as usize;
        if num_nodes > slot_count {
            return Err(invalid(format!(
                "graph holds {num_nodes} nodes but only {slot_count} vectors exist"
            )));
        }
        let entry_raw = read_u32(reader)?;
        let max_layer = read_u8(reader)? as usize;
        let m = read_u32(reader)? as usize;
        let m0 = read_u32(reader)? as usize;
        let ef_construction = read_u32(reader)? as usize;

        let check = |slot: u32| {
            let slot = slot as usize;
            if slot < slot_count {
                Ok(slot)
            } else {
                Err(invalid(format!("slot {slot} out of range ({slot_count} vectors)")))
            }
        };

        let mut nodes = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            let slot = check(read_u32(reader)?)?;
            let top_layer = read_u8(reader)? as usize;
            if top_layer > max_layer {
                return Err(invalid(format!(
                    "node {slot} claims layer {top_layer} above graph max {max_layer}"
                )));
            }
            let mut links = Vec::with_capacity(top_layer + 1);
            for _ in 0..=top_layer {
                let count = read_u32(reader)? as usize;
                if count > slot_count {
                    return Err(invalid(format!("node {slot} has {count} neighbours")));
                }
                let mut neighbors = Vec::with_capacity(count);
                for _ in 0..count {
                    neighbors.push(check(read_u32(reader)?)?);
                }
                links.push(neighbors);
            }
            nodes.push(Node { slot, links });
        }

        let entry_point = match entry_raw {
            NO_ENTRY => None,
            raw => Some(check(raw)?),
        };
        if entry_point.is_none() != nodes.is_empty() {
            return Err(invalid("graph entry point disagrees with node count"));
        }

        Ok(Hnsw::from_parts(
            metric,
            nodes,
            entry_point,
            max_layer,
            m,
            m0,
            ef_construction,
            seed,
        ))
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}
