//! Commit-graph file writer.
//!
//! Generates commit-graph files matching Git's `commit-graph-format.txt` specification.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use git_hash::{hasher::Hasher, HashAlgorithm, ObjectId};
use git_utils::tempfile::TempFile;

use crate::PackError;

/// Internal representation of a commit for graph writing.
struct CommitEntry {
    oid: ObjectId,
    tree_oid: ObjectId,
    parent_oids: Vec<ObjectId>,
    generation: u32,
    commit_time: i64,
}

/// Writer for commit-graph files in Git's binary format.
pub struct CommitGraphWriter {
    commits: Vec<CommitEntry>,
    hash_algo: HashAlgorithm,
}

impl CommitGraphWriter {
    /// Create a writer for the given hash algorithm.
    pub fn new(hash_algo: HashAlgorithm) -> Self {
        Self {
            commits: Vec::new(),
            hash_algo,
        }
    }

    /// Add a commit to be included in the graph.
    pub fn add_commit(
        &mut self,
        oid: ObjectId,
        tree_oid: ObjectId,
        parents: Vec<ObjectId>,
        commit_time: i64,
    ) {
        self.commits.push(CommitEntry {
            oid,
            tree_oid,
            parent_oids: parents,
            generation: 0, // computed later
            commit_time,
        });
    }

    /// Compute generation numbers and write the graph file.
    /// Returns the checksum of the written file.
    pub fn write(mut self, path: impl AsRef<Path>) -> Result<ObjectId, PackError> {
        if self.commits.is_empty() {
            return Err(PackError::InvalidCommitGraph(
                "no commits to write".into(),
            ));
        }

        // Sort commits by OID (required by format).
        self.commits.sort_by(|a, b| a.oid.as_bytes().cmp(b.oid.as_bytes()));

        // Build OID → index mapping.
        let oid_to_idx: HashMap<ObjectId, u32> = self
            .commits
            .iter()
            .enumerate()
            .map(|(i, c)| (c.oid, i as u32))
            .collect();

        // Compute generation numbers.
        self.compute_generations(&oid_to_idx);

        let hash_len = match self.hash_algo {
            HashAlgorithm::Sha1 => 20usize,
            HashAlgorithm::Sha256 => 32usize,
        };

        // Determine if we need an extra edges chunk.
        let has_extra_edges = self.commits.iter().any(|c| c.parent_oids.len() > 2);

        // Build extra edges list.
        let mut extra_edges: Vec<u32> = Vec::new();
        let mut extra_edge_offsets: HashMap<u32, usize> = HashMap::new(); // commit idx → offset into extra_edges

        if has_extra_edges {
            for (idx, commit) in self.commits.iter().enumerate() {
                if commit.parent_oids.len() > 2 {
                    extra_edge_offsets.insert(idx as u32, extra_edges.len());
                    // Every parent from the second one on lives in the extra
                    // edge list (the commit-data row's parent2 slot only
                    // holds a pointer into this list, not a parent index).
                    for (p_idx, parent) in commit.parent_oids.iter().enumerate().skip(1) {
                        let parent_graph_idx = oid_to_idx.get(parent).copied().unwrap_or(0x7000_0000);
                        let is_last = p_idx == commit.parent_oids.len() - 1;
                        let val = if is_last {
                            parent_graph_idx | 0x8000_0000
                        } else {
                            parent_graph_idx
                        };
                        extra_edges.push(val);
                    }
                }
            }
        }

        let num_commits = self.commits.len() as u32;
        let num_chunks: u8 = if has_extra_edges { 4 } else { 3 };

        // Compute chunk sizes.
        let fanout_size: usize = 256 * 4;
        let oid_lookup_size: usize = num_commits as usize * hash_len;
        let commit_data_entry_size: usize = hash_len + 16; // tree_oid + parent1 + parent2 + gen/date
        let commit_data_size: usize = num_commits as usize * commit_data_entry_size;
        let extra_edges_size: usize = extra_edges.len() * 4;

        // Header: signature(4) + version(1) + hash_version(1) + num_chunks(1) + base_graph_count(1) = 8
        let header_size: usize = 8;
        // TOC: (num_chunks + 1) entries × 12 bytes each
        let toc_size: usize = (num_chunks as usize + 1) * 12;
        let data_start = header_size + toc_size;

        // Compute offsets.
        let fanout_offset = data_start;
        let oid_lookup_offset = fanout_offset + fanout_size;
        let commit_data_offset = oid_lookup_offset + oid_lookup_size;
        let extra_edges_offset = commit_data_offset + commit_data_size;
        let file_end = if has_extra_edges {
            extra_edges_offset + extra_edges_size
        } else {
            commit_data_offset + commit_data_size
        };

        let mut buf: Vec<u8> = Vec::with_capacity(file_end + hash_len);

        // Write header.
        buf.extend_from_slice(b"CGPH");
        buf.push(1); // version
        buf.push(match self.hash_algo {
            HashAlgorithm::Sha1 => 1,
            HashAlgorithm::Sha256 => 2,
        });
        buf.push(num_chunks);
        buf.push(0); // base graph count (no chain support)

        // Write chunk TOC.
        // Entry: chunk_id(4) + offset(8)
        write_toc_entry(&mut buf, 0x4F494446, fanout_offset as u64); // OIDF
        write_toc_entry(&mut buf, 0x4F49444C, oid_lookup_offset as u64); // OIDL
        write_toc_entry(&mut buf, 0x43444154, commit_data_offset as u64); // CDAT
        if has_extra_edges {
            write_toc_entry(&mut buf, 0x45444745, extra_edges_offset as u64); // EDGE
        }
        // Terminating TOC entry: zero ID + file_end offset
        write_toc_entry(&mut buf, 0x0000_0000, file_end as u64);

        // Write OID Fanout (256 × 4-byte cumulative counts).
        let mut fanout = [0u32; 256];
        for commit in &self.commits {
            let first_byte = commit.oid.as_bytes()[0] as usize;
            for item in fanout.iter_mut().skip(first_byte) {
                *item += 1;
            }
        }
        for count in &fanout {
            buf.extend_from_slice(&count.to_be_bytes());
        }

        // Write OID Lookup (sorted OIDs).
        for commit in &self.commits {
            buf.extend_from_slice(commit.oid.as_bytes());
        }

        // Write Commit Data.
        const PARENT_NONE: u32 = 0x7000_0000;
        const PARENT_EXTRA_EDGE: u32 = 0x8000_0000;

        for (idx, commit) in self.commits.iter().enumerate() {
            // Tree OID
            buf.extend_from_slice(commit.tree_oid.as_bytes());

            // Parent 1
            let parent1 = if commit.parent_oids.is_empty() {
                PARENT_NONE
            } else {
                oid_to_idx
                    .get(&commit.parent_oids[0])
                    .copied()
                    .unwrap_or(PARENT_NONE)
            };
            buf.extend_from_slice(&parent1.to_be_bytes());

            // Parent 2
            let parent2 = if commit.parent_oids.len() <= 1 {
                PARENT_NONE
            } else if commit.parent_oids.len() == 2 {
                oid_to_idx
                    .get(&commit.parent_oids[1])
                    .copied()
                    .unwrap_or(PARENT_NONE)
            } else {
                // Octopus merge: parent2 points into the extra edge list,
                // which holds parent_oids[1..] in order (see extra_edges above).
                let edge_offset = extra_edge_offsets
                    .get(&(idx as u32))
                    .copied()
                    .unwrap_or(0);
                PARENT_EXTRA_EDGE | edge_offset as u32
            };
            buf.extend_from_slice(&parent2.to_be_bytes());

            // Generation number + commit date
            let generation = commit.generation.min(0x3FFF_FFFF);
            let commit_time = commit.commit_time as u64;
            let date_high = ((commit_time >> 32) & 0x3) as u32;
            let gen_date = (generation << 2) | date_high;
            let date_low = (commit_time & 0xFFFF_FFFF) as u32;
            buf.extend_from_slice(&gen_date.to_be_bytes());
            buf.extend_from_slice(&date_low.to_be_bytes());
        }

        // Write Extra Edges (if any). `extra_edges` was already computed
        // above in the same pass used to size `extra_edges_size`/`file_end`,
        // so the bytes written here match exactly what was sized for.
        if has_extra_edges {
            debug_assert_eq!(buf.len(), extra_edges_offset);
            for val in &extra_edges {
                buf.extend_from_slice(&val.to_be_bytes());
            }
        }

        // Write trailing checksum.
        let checksum_oid = Hasher::digest(self.hash_algo, &buf)?;
        buf.extend_from_slice(checksum_oid.as_bytes());

        // Ensure parent directory exists.
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write atomically via temp file, same convention as loose object writes.
        let mut tmp = TempFile::new_for(path.as_ref())?;
        tmp.write_all(&buf)?;
        tmp.flush()?;
        tmp.persist(path.as_ref())?;

        Ok(checksum_oid)
    }

    /// Compute generation numbers bottom-up.
    fn compute_generations(&mut self, oid_to_idx: &HashMap<ObjectId, u32>) {
        let n = self.commits.len();

        // Build adjacency: child → parents (as indices)
        let parent_indices: Vec<Vec<u32>> = self
            .commits
            .iter()
            .map(|c| {
                c.parent_oids
                    .iter()
                    .filter_map(|p| oid_to_idx.get(p).copied())
                    .collect()
            })
            .collect();

        // Compute generations via iterative DFS.
        let mut generations = vec![0u32; n];
        let mut visited = vec![false; n];
        let mut stack: Vec<(usize, bool)> = Vec::new();

        for i in 0..n {
            if !visited[i] {
                stack.push((i, false));
                while let Some((idx, processed)) = stack.pop() {
                    if processed {
                        let max_parent_gen = parent_indices[idx]
                            .iter()
                            .map(|&p| generations[p as usize])
                            .max()
                            .unwrap_or(0);
                        generations[idx] = max_parent_gen + 1;
                    } else if !visited[idx] {
                        visited[idx] = true;
                        stack.push((idx, true));
                        for &p in &parent_indices[idx] {
                            if !visited[p as usize] {
                                stack.push((p as usize, false));
                            }
                        }
                    }
                }
            }
        }

        // Store generations.
        for (i, gen) in generations.into_iter().enumerate() {
            self.commits[i].generation = gen;
        }
    }
}

fn write_toc_entry(buf: &mut Vec<u8>, chunk_id: u32, offset: u64) {
    buf.extend_from_slice(&chunk_id.to_be_bytes());
    buf.extend_from_slice(&offset.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_graph::CommitGraph;

    fn make_oid(first_byte: u8) -> ObjectId {
        let mut bytes = [0u8; 20];
        bytes[0] = first_byte;
        ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap()
    }

    #[test]
    fn linear_history_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let root = make_oid(0x10);
        let child = make_oid(0x20);

        let mut writer = CommitGraphWriter::new(HashAlgorithm::Sha1);
        writer.add_commit(root, make_oid(0x11), vec![], 1000);
        writer.add_commit(child, make_oid(0x21), vec![root], 2000);

        let path = dir.path().join("commit-graph");
        writer.write(&path).unwrap();

        let graph = CommitGraph::open(&path).unwrap();
        assert_eq!(graph.num_commits(), 2);

        let root_entry = graph.lookup(&root).unwrap();
        assert!(root_entry.parent_oids.is_empty());
        assert_eq!(root_entry.generation, 1);

        let child_entry = graph.lookup(&child).unwrap();
        assert_eq!(child_entry.parent_oids, vec![root]);
        assert_eq!(child_entry.generation, 2);
        assert_eq!(child_entry.commit_time, 2000);
    }

    #[test]
    fn octopus_merge_extra_edges_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = make_oid(0x10);
        let a = make_oid(0x20);
        let b = make_oid(0x30);
        let c = make_oid(0x40);
        let merge = make_oid(0x50);

        let mut writer = CommitGraphWriter::new(HashAlgorithm::Sha1);
        writer.add_commit(root, make_oid(0x11), vec![], 1000);
        writer.add_commit(a, make_oid(0x21), vec![root], 2000);
        writer.add_commit(b, make_oid(0x31), vec![root], 2000);
        writer.add_commit(c, make_oid(0x41), vec![root], 2000);
        writer.add_commit(merge, make_oid(0x51), vec![a, b, c], 3000);

        let path = dir.path().join("commit-graph");
        writer.write(&path).unwrap();

        let graph = CommitGraph::open(&path).unwrap();
        assert_eq!(graph.num_commits(), 5);

        let merge_entry = graph.lookup(&merge).unwrap();
        assert_eq!(merge_entry.parent_oids, vec![a, b, c]);
        assert_eq!(merge_entry.generation, 2);
    }

    #[test]
    fn two_octopus_merges_have_independent_extra_edge_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let root = make_oid(0x01);
        let a = make_oid(0x02);
        let b = make_oid(0x03);
        let c = make_oid(0x04);
        let d = make_oid(0x05);
        let merge1 = make_oid(0x06);
        let merge2 = make_oid(0x07);

        let mut writer = CommitGraphWriter::new(HashAlgorithm::Sha1);
        writer.add_commit(root, make_oid(0x21), vec![], 1000);
        writer.add_commit(a, make_oid(0x22), vec![root], 2000);
        writer.add_commit(b, make_oid(0x23), vec![root], 2000);
        writer.add_commit(c, make_oid(0x24), vec![root], 2000);
        writer.add_commit(d, make_oid(0x25), vec![root], 2000);
        writer.add_commit(merge1, make_oid(0x26), vec![a, b, c], 3000);
        writer.add_commit(merge2, make_oid(0x27), vec![a, b, c, d], 3000);

        let path = dir.path().join("commit-graph");
        writer.write(&path).unwrap();

        let graph = CommitGraph::open(&path).unwrap();
        let merge1_entry = graph.lookup(&merge1).unwrap();
        assert_eq!(merge1_entry.parent_oids, vec![a, b, c]);
        let merge2_entry = graph.lookup(&merge2).unwrap();
        assert_eq!(merge2_entry.parent_oids, vec![a, b, c, d]);
    }
}
