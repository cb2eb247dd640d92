use crate::error::{BdevError, BdevResult};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// The fixed 72-byte qcow2 version 2 header, stored big-endian at byte 0
/// of the image. The on-disk layout is field-by-field with no padding,
/// which bincode's fixint big-endian options produce exactly.
#[derive(Debug, Default, Deserialize, Serialize)]
struct RawHeader {
    /// QCOW magic string ("QFI\xfb")
    magic: u32,

    /// Version number; only 2 is accepted here.
    version: u32,

    /// Offset of the backing file name, 0 if there is none. Images with a
    /// backing file are refused by this engine.
    backing_file_offset: u64,

    /// Length of the backing file name in bytes.
    backing_file_size: u32,

    /// Number of bits used for addressing an offset within a cluster
    /// (1 << cluster_bits is the cluster size). Must not be less than 9.
    cluster_bits: u32,

    /// Virtual disk size in bytes.
    size: u64,

    /// 0 for no encryption; anything else is refused.
    crypt_method: u32,

    /// Number of entries in the active L1 table.
    l1_size: u32,

    /// Offset of the active L1 table. Cluster-aligned.
    l1_table_offset: u64,

    /// Offset of the refcount table. Cluster-aligned.
    refcount_table_offset: u64,

    /// Number of clusters the refcount table occupies.
    refcount_table_clusters: u32,

    /// Number of snapshots contained in the image. Preserved, never
    /// interpreted.
    nb_snapshots: u32,

    /// Offset of the snapshot table. Preserved, never interpreted.
    snapshots_offset: u64,
}

fn header_codec() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

#[derive(Debug)]
pub struct Qcow2Header {
    raw: RawHeader,
}

impl Qcow2Header {
    pub const QCOW2_MAGIC: u32 = 0x51_46_49_fb;
    pub const SIZE: usize = 72;

    /// Build the header of a freshly formatted image: version 2, no
    /// encryption, refcount table in cluster 1, L1 table starting at
    /// cluster 2.
    pub fn new_formatted(size: u64, cluster_bits: u32) -> Self {
        let cluster_size = 1u64 << cluster_bits;

        Qcow2Header {
            raw: RawHeader {
                magic: Self::QCOW2_MAGIC,
                version: 2,
                cluster_bits,
                size,
                l1_size: Self::l1_entries_for(size, cluster_bits),
                l1_table_offset: 2 * cluster_size,
                refcount_table_offset: cluster_size,
                refcount_table_clusters: 1,
                ..Default::default()
            },
        }
    }

    pub fn from_buf(buf: &[u8]) -> BdevResult<Self> {
        if buf.len() < Self::SIZE {
            return Err(BdevError::Unknown(format!(
                "header needs {} bytes, got {}",
                Self::SIZE,
                buf.len()
            )));
        }

        let raw: RawHeader = header_codec().deserialize(&buf[..Self::SIZE])?;

        if raw.magic != Self::QCOW2_MAGIC {
            return Err("not a qcow2 image".into());
        }
        if raw.version != 2 {
            let v = raw.version;
            return Err(format!("qcow2 v{} is not supported", v).into());
        }
        if !(9..=63).contains(&raw.cluster_bits) {
            let bits = raw.cluster_bits;
            return Err(format!("invalid cluster_bits {}", bits).into());
        }
        if raw.crypt_method != 0 {
            return Err(BdevError::Unsupported("encryption"));
        }
        if raw.backing_file_offset != 0 {
            return Err(BdevError::Unsupported("backing file"));
        }
        if raw.refcount_table_clusters < 1 {
            return Err("refcount table occupies no clusters".into());
        }

        let cluster_mask = (1u64 << raw.cluster_bits) - 1;
        if raw.l1_table_offset & cluster_mask != 0 {
            let off = raw.l1_table_offset;
            return Err(format!("l1 table offset {:x} is not cluster aligned", off).into());
        }
        if raw.refcount_table_offset & cluster_mask != 0 {
            let off = raw.refcount_table_offset;
            return Err(format!("refcount table offset {:x} is not cluster aligned", off).into());
        }

        Ok(Qcow2Header { raw })
    }

    /// Serialize into the 72 on-disk bytes. The caller places these at the
    /// start of the first cluster; the rest of that cluster is zero.
    pub fn serialize_to_buf(&self) -> BdevResult<Vec<u8>> {
        let buf = header_codec().serialize(&self.raw)?;
        debug_assert_eq!(buf.len(), Self::SIZE);
        Ok(buf)
    }

    /// Number of L1 entries needed to address `size` bytes: one entry per
    /// `2^(2 * cluster_bits - 3)` bytes of guest space.
    pub fn l1_entries_for(size: u64, cluster_bits: u32) -> u32 {
        let bytes_per_l2 = Self::bytes_per_l2(cluster_bits);
        ((size + bytes_per_l2 - 1) / bytes_per_l2) as u32
    }

    /// Guest bytes covered by one L2 table.
    #[inline]
    pub fn bytes_per_l2(cluster_bits: u32) -> u64 {
        1u64 << (2 * cluster_bits - 3)
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.raw.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.raw.size = size;
    }

    #[inline]
    pub fn cluster_bits(&self) -> u32 {
        self.raw.cluster_bits
    }

    #[inline]
    pub fn l1_size(&self) -> u32 {
        self.raw.l1_size
    }

    #[inline]
    pub fn l1_table_offset(&self) -> u64 {
        self.raw.l1_table_offset
    }

    #[inline]
    pub fn refcount_table_offset(&self) -> u64 {
        self.raw.refcount_table_offset
    }

    #[inline]
    pub fn refcount_table_clusters(&self) -> u32 {
        self.raw.refcount_table_clusters
    }

    #[inline]
    pub fn nb_snapshots(&self) -> u32 {
        self.raw.nb_snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_serializes_to_72_bytes() {
        let h = Qcow2Header::new_formatted(1 << 20, 16);
        assert_eq!(h.serialize_to_buf().unwrap().len(), Qcow2Header::SIZE);
    }

    #[test]
    fn test_formatted_roundtrip() {
        let h = Qcow2Header::new_formatted(1 << 30, 16);
        let buf = h.serialize_to_buf().unwrap();
        assert_eq!(buf.len(), 72);
        // magic and version land big-endian at the front
        assert_eq!(&buf[..4], &Qcow2Header::QCOW2_MAGIC.to_be_bytes());
        assert_eq!(&buf[4..8], &2u32.to_be_bytes());

        let h2 = Qcow2Header::from_buf(&buf).unwrap();
        assert_eq!(h2.size(), 1 << 30);
        assert_eq!(h2.cluster_bits(), 16);
        assert_eq!(h2.l1_size(), 2);
        assert_eq!(h2.l1_table_offset(), 2 << 16);
        assert_eq!(h2.refcount_table_offset(), 1 << 16);
        assert_eq!(h2.refcount_table_clusters(), 1);
        assert_eq!(h2.nb_snapshots(), 0);
    }

    #[test]
    fn test_l1_entries_for() {
        // 2^(2*16 - 3) = 512 MiB of guest space per L2 table
        assert_eq!(Qcow2Header::bytes_per_l2(16), 512 << 20);
        assert_eq!(Qcow2Header::l1_entries_for(1 << 30, 16), 2);
        assert_eq!(Qcow2Header::l1_entries_for((1 << 30) + 1, 16), 3);
        assert_eq!(Qcow2Header::l1_entries_for(512 << 20, 16), 1);
    }

    #[test]
    fn test_bad_magic_refused() {
        let mut buf = Qcow2Header::new_formatted(1 << 20, 16)
            .serialize_to_buf()
            .unwrap();
        buf[0] = 0;
        assert!(Qcow2Header::from_buf(&buf).is_err());
    }

    #[test]
    fn test_v3_refused() {
        let mut buf = Qcow2Header::new_formatted(1 << 20, 16)
            .serialize_to_buf()
            .unwrap();
        buf[4..8].copy_from_slice(&3u32.to_be_bytes());
        assert!(Qcow2Header::from_buf(&buf).is_err());
    }

    #[test]
    fn test_encrypted_refused() {
        let mut buf = Qcow2Header::new_formatted(1 << 20, 16)
            .serialize_to_buf()
            .unwrap();
        // crypt_method is at byte 32 (after magic, version, backing offset,
        // backing size, cluster_bits, size)
        buf[32..36].copy_from_slice(&1u32.to_be_bytes());
        let err = Qcow2Header::from_buf(&buf).unwrap_err();
        assert!(matches!(err, BdevError::Unsupported("encryption")));
    }

    #[test]
    fn test_backing_file_refused() {
        let mut buf = Qcow2Header::new_formatted(1 << 20, 16)
            .serialize_to_buf()
            .unwrap();
        buf[8..16].copy_from_slice(&72u64.to_be_bytes());
        let err = Qcow2Header::from_buf(&buf).unwrap_err();
        assert!(matches!(err, BdevError::Unsupported("backing file")));
    }

    #[test]
    fn test_short_buffer_refused() {
        assert!(Qcow2Header::from_buf(&[0u8; 40]).is_err());
    }
}
