//! PackFile: reading .pack files.
//!
//! A pack file contains a header, a sequence of compressed objects
//! (possibly deltified), and a trailing checksum.

use std::path::{Path, PathBuf};

use flate2::bufread::ZlibDecoder;
use git_hash::{HashAlgorithm, ObjectId};
use git_object::ObjectType;
use memmap2::Mmap;
use std::io::Read;

use crate::entry::{parse_entry_header, PackEntry};
use crate::index::PackIndex;
use crate::size_index::SizeIndex;
use crate::{
    PackEntryType, PackError, PackedObject, PACK_HEADER_SIZE, PACK_SIGNATURE, PACK_VERSION,
    DEFAULT_MAX_DELTA_CHAIN_DEPTH, MAX_DELTA_CHAIN_DEPTH_CEILING,
};

/// A memory-mapped packfile with its index.
pub struct PackFile {
    data: Mmap,
    index: PackIndex,
    /// Object-size index (`.size` sibling), loaded opportunistically if present.
    size_index: Option<SizeIndex>,
    pack_path: PathBuf,
    num_objects: u32,
    hash_algo: HashAlgorithm,
    max_delta_depth: usize,
}

impl PackFile {
    /// Open a pack file and its associated index.
    ///
    /// Given a `.pack` file path, opens both the pack and its `.idx` file.
    pub fn open(pack_path: impl AsRef<Path>) -> Result<Self, PackError> {
        let pack_path = pack_path.as_ref().to_path_buf();

        // Derive .idx path from .pack path
        let idx_path = pack_path.with_extension("idx");

        let file = std::fs::File::open(&pack_path)?;
        let data = unsafe { Mmap::map(&file)? };

        // Validate pack header
        if data.len() < PACK_HEADER_SIZE {
            return Err(PackError::InvalidHeader("file too small".into()));
        }
        if &data[0..4] != PACK_SIGNATURE {
            return Err(PackError::InvalidHeader("bad PACK signature".into()));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        let num_objects = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let index = PackIndex::open(&idx_path)?;

        // Validate object count matches between pack and index
        if index.num_objects() != num_objects {
            return Err(PackError::InvalidHeader(format!(
                "pack has {} objects but index has {}",
                num_objects,
                index.num_objects()
            )));
        }

        // The idx trailer's pack-checksum field must match the pack's own
        // trailing 20 bytes (spec testable property: idx trailer agrees
        // with the pack it indexes, not just with itself).
        let pack_trailer_start = data.len() - 20;
        let pack_trailer = ObjectId::from_bytes(&data[pack_trailer_start..], HashAlgorithm::Sha1)
            .map_err(|_| PackError::InvalidHeader("pack trailer malformed".into()))?;
        let idx_pack_checksum = index.pack_checksum();
        if pack_trailer != idx_pack_checksum {
            return Err(PackError::ChecksumMismatch {
                expected: idx_pack_checksum,
                actual: pack_trailer,
            });
        }

        // Object-size index is optional; a missing or unreadable one just
        // means is_not_larger_than always falls back to inflating.
        let size_index_path = pack_path.with_extension("size");
        let size_index = SizeIndex::open(&size_index_path).ok();

        Ok(Self {
            data,
            index,
            size_index,
            pack_path,
            num_objects,
            hash_algo: HashAlgorithm::Sha1,
            max_delta_depth: DEFAULT_MAX_DELTA_CHAIN_DEPTH,
        })
    }

    /// Override the maximum delta chain depth tolerated when resolving objects.
    /// Clamped to `MAX_DELTA_CHAIN_DEPTH_CEILING` regardless of the requested value.
    pub fn set_max_delta_depth(&mut self, depth: usize) {
        self.max_delta_depth = depth.min(MAX_DELTA_CHAIN_DEPTH_CEILING);
    }

    /// Current maximum delta chain depth.
    pub fn max_delta_depth(&self) -> usize {
        self.max_delta_depth
    }

    /// Read an object by OID.
    ///
    /// Returns `None` if the OID is not in this pack.
    pub fn read_object(&self, oid: &ObjectId) -> Result<Option<PackedObject>, PackError> {
        match self.index.lookup(oid) {
            Some(offset) => self.read_at_offset(offset).map(Some),
            None => Ok(None),
        }
    }

    /// Read an object at a known offset in the pack.
    ///
    /// Resolves delta chains iteratively (not recursively) to handle
    /// arbitrary chain depths safely.
    pub fn read_at_offset(&self, offset: u64) -> Result<PackedObject, PackError> {
        self.read_at_offset_with_resolver(offset, |_| None)
    }

    /// Read an object by OID, serving the fully delta-resolved result from
    /// `cache` when present rather than re-walking the delta chain on every
    /// call. `identity` must be stable across opens of the same underlying
    /// file and must change across a repack, since it is embedded in the
    /// cache key — see [`block_cache::BlockCache`].
    pub fn read_object_cached(
        &self,
        oid: &ObjectId,
        identity: &crate::block_cache::PackIdentity,
        cache: &crate::block_cache::BlockCache,
    ) -> Result<Option<PackedObject>, PackError> {
        let Some(offset) = self.index.lookup(oid) else {
            return Ok(None);
        };
        let key = crate::block_cache::BlockCacheKey {
            stream: crate::block_cache::StreamKey {
                pack: identity.clone(),
                ext: crate::block_cache::PackExt::Pack,
            },
            block_offset: offset,
        };
        let value = cache.get_or_load(key, || {
            let obj = self.read_at_offset(offset)?;
            let size = obj.data.len();
            Ok::<_, PackError>((
                crate::block_cache::CacheValue::Ref(std::sync::Arc::new(obj)),
                size,
            ))
        })?;
        match value {
            crate::block_cache::CacheValue::Ref(any) => Ok(Some(
                any.downcast_ref::<PackedObject>()
                    .expect("Pack-ext cache entries always hold a PackedObject")
                    .clone(),
            )),
            crate::block_cache::CacheValue::Block(_) => {
                unreachable!("read_object_cached only ever inserts CacheValue::Ref")
            }
        }
    }

    /// Read an object by OID, with an external resolver for cross-pack REF_DELTA bases.
    ///
    /// The resolver is called when a REF_DELTA references a base OID not found in this pack.
    /// It should return the resolved base object's type and data if found externally.
    pub fn read_object_with_resolver(
        &self,
        oid: &ObjectId,
        resolver: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<Option<PackedObject>, PackError> {
        match self.index.lookup(oid) {
            Some(offset) => self.read_at_offset_with_resolver(offset, resolver).map(Some),
            None => Ok(None),
        }
    }

    /// Read an object at a known offset, with an external resolver for cross-pack REF_DELTA bases.
    fn read_at_offset_with_resolver(
        &self,
        offset: u64,
        resolver: impl Fn(&ObjectId) -> Option<(ObjectType, Vec<u8>)>,
    ) -> Result<PackedObject, PackError> {
        // Build the delta chain (innermost delta first, base last)
        let mut chain: Vec<(PackEntry, Vec<u8>)> = Vec::new();
        let mut visited_offsets = std::collections::HashSet::new();
        let mut current_offset = offset;

        for depth in 0..self.max_delta_depth {
            if !visited_offsets.insert(current_offset) {
                return Err(PackError::DeltaCycle(current_offset));
            }

            let entry = parse_entry_header(
                &self.data[current_offset as usize..],
                current_offset,
            )?;

            // Decompress the data
            let compressed = &self.data[entry.data_offset as usize..];
            let decompressed = decompress(compressed, entry.uncompressed_size, current_offset)?;

            match entry.entry_type {
                PackEntryType::Commit
                | PackEntryType::Tree
                | PackEntryType::Blob
                | PackEntryType::Tag => {
                    // Base object — resolve chain
                    let obj_type = entry
                        .entry_type
                        .to_object_type()
                        .expect("non-delta type");

                    // Apply delta chain in reverse order
                    let mut data = decompressed;
                    for (_, delta_data) in chain.iter().rev() {
                        data = crate::delta::apply::apply_delta(&data, delta_data)?;
                    }

                    return Ok(PackedObject {
                        obj_type,
                        data,
                    });
                }
                PackEntryType::OfsDelta { base_offset } => {
                    chain.push((entry, decompressed));
                    current_offset = base_offset;
                }
                PackEntryType::RefDelta { base_oid } => {
                    chain.push((entry, decompressed));
                    // Try the index within this pack first
                    if let Some(base_offset) = self.index.lookup(&base_oid) {
                        current_offset = base_offset;
                    } else if let Some((obj_type, base_data)) = resolver(&base_oid) {
                        // External resolver found the base — apply delta chain
                        let mut data = base_data;
                        for (_, delta_data) in chain.iter().rev() {
                            data = crate::delta::apply::apply_delta(&data, delta_data)?;
                        }
                        return Ok(PackedObject { obj_type, data });
                    } else {
                        return Err(PackError::MissingBase(base_oid));
                    }
                }
            }

            if depth + 1 >= self.max_delta_depth {
                return Err(PackError::DeltaChainTooDeep {
                    offset,
                    max_depth: self.max_delta_depth,
                });
            }
        }

        Err(PackError::DeltaChainTooDeep {
            offset,
            max_depth: self.max_delta_depth,
        })
    }

    /// Read an object by OID, first verifying its on-disk CRC32 (from the
    /// idx) against the raw entry bytes. Opt-in: pays for a second pass over
    /// the compressed bytes to catch silent corruption that wouldn't surface
    /// until the object's own hash is checked further up the stack.
    pub fn read_object_verified(&self, oid: &ObjectId) -> Result<Option<PackedObject>, PackError> {
        let Some(pos) = self.index.lookup_position(oid) else {
            return Ok(None);
        };
        let offset = self.index.offset_at_index(pos);
        self.verify_entry_crc32(offset, self.index.crc32_at_index(pos))?;
        self.read_at_offset(offset).map(Some)
    }

    /// Verify the CRC32 of the raw entry (header + compressed body) at
    /// `offset` against `expected`, the value recorded in the idx.
    fn verify_entry_crc32(&self, offset: u64, expected: u32) -> Result<(), PackError> {
        let entry = parse_entry_header(&self.data[offset as usize..], offset)?;
        let compressed_start = entry.data_offset as usize;

        let mut decoder = ZlibDecoder::new(&self.data[compressed_start..]);
        let mut buf = Vec::with_capacity(entry.uncompressed_size);
        decoder
            .read_to_end(&mut buf)
            .map_err(|_| PackError::CorruptEntry(offset))?;
        let entry_end = compressed_start + decoder.total_in() as usize;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[offset as usize..entry_end]);
        let actual = hasher.finalize();

        if actual != expected {
            return Err(PackError::CorruptEntry(offset));
        }
        Ok(())
    }

    /// Answer "is this object's inflated size at most `limit` bytes?"
    /// without inflating it when possible.
    ///
    /// Delta entries always require inflating to know the final size. A
    /// non-delta entry consults the object-size index (if present and the
    /// position is indexed); otherwise falls back to inflating.
    pub fn is_not_larger_than(&self, oid: &ObjectId, limit: u64) -> Result<Option<bool>, PackError> {
        let Some(pos) = self.index.lookup_position(oid) else {
            return Ok(None);
        };
        let offset = self.index.offset_at_index(pos);
        let entry = parse_entry_header(&self.data[offset as usize..], offset)?;

        if matches!(entry.entry_type, PackEntryType::OfsDelta { .. } | PackEntryType::RefDelta { .. }) {
            let obj = self.read_at_offset(offset)?;
            return Ok(Some(obj.data.len() as u64 <= limit));
        }

        if let Some(size_index) = &self.size_index {
            let sz = size_index.size_at_position(pos);
            if sz >= 0 {
                return Ok(Some((sz as u64) <= limit));
            }
        }

        let obj = self.read_at_offset(offset)?;
        Ok(Some(obj.data.len() as u64 <= limit))
    }

    /// Check if this pack contains the given OID.
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.index.lookup(oid).is_some()
    }

    /// Get the number of objects in this pack.
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    /// Get the pack index.
    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    /// Get the path to the .pack file.
    pub fn path(&self) -> &Path {
        &self.pack_path
    }

    /// Derive this pack's block-cache identity from its filename (the
    /// trailer SHA-1, per `pack-<sha>.pack`). A repack writes a new file
    /// under a new SHA-1, so cache entries keyed on this identity can never
    /// alias bytes from a pack that has since been superseded.
    pub fn pack_identity(&self) -> crate::block_cache::PackIdentity {
        let name = self
            .pack_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("");
        crate::block_cache::PackIdentity::new(name)
    }

    /// Get the raw memory-mapped pack data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get the hash algorithm used by this pack.
    pub fn hash_algo(&self) -> HashAlgorithm {
        self.hash_algo
    }
}

/// Decompress zlib data with an expected uncompressed size.
fn decompress(compressed: &[u8], expected_size: usize, offset: u64) -> Result<Vec<u8>, PackError> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut buf = Vec::with_capacity(expected_size);
    decoder.read_to_end(&mut buf).map_err(|_| {
        PackError::CorruptEntry(offset)
    })?;
    Ok(buf)
}
