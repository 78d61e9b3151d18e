//! The top-key record published at the repository's USK.
//!
//! ```text
//!   u8[8]   magic "HGINF100"
//!   u8      salt
//!   u8      graph_chk_count
//!   CHK[]   graph_chks              69 bytes each
//!   repeated update:
//!     i64     bundle_length          big endian
//!     u8[20]  parent_rev
//!     u8[20]  head_rev
//!     u8      chk_count              low 6 bits; bit 7 heads truncated,
//!                                    bit 6 parents truncated
//!     CHK[]   chks
//! ```
//!
//! Only the first parent and head of each update go on the wire. Updates
//! are ordered newest first and the oldest are dropped until the record
//! fits in [`MAX_TOP_KEY_LEN`] bytes.

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use infocalypse_keys::CHK_LEN;
use infocalypse_keys::Chk;

use crate::constants::MAX_TOP_KEY_LEN;
use crate::constants::MAX_UPDATE_CHKS;
use crate::constants::TOP_KEY_MAGIC;
use crate::error::UpdateError;
use crate::error::UpdateResult;
use crate::types::CHANGESET_ID_LEN;
use crate::types::ChangesetId;
use crate::types::NULL_REV;

const HEADS_TRUNCATED: u8 = 0x80;
const PARENTS_TRUNCATED: u8 = 0x40;
const CHK_COUNT_MASK: u8 = 0x3f;

const HEADER_LEN: usize = TOP_KEY_MAGIC.len() + 2;
const UPDATE_HEADER_LEN: usize = 8 + 2 * CHANGESET_ID_LEN + 1;

/// Maximum graph CHKs one top-key advertises.
pub const MAX_GRAPH_CHKS: usize = 2;

/// One advertised update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopKeyUpdate {
    pub length: u64,
    pub parents: Vec<ChangesetId>,
    pub heads: Vec<ChangesetId>,
    pub chks: Vec<Chk>,
    /// False when `parents` is known to be a subset.
    pub parents_complete: bool,
    /// False when `heads` is known to be a subset.
    pub heads_complete: bool,
}

impl TopKeyUpdate {
    fn encoded_len(&self) -> usize {
        UPDATE_HEADER_LEN + self.chks.len() * CHK_LEN
    }
}

/// Decoded top-key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopKey {
    pub graph_chks: Vec<Chk>,
    pub updates: Vec<TopKeyUpdate>,
}

impl TopKey {
    /// Encode with the given salt byte.
    pub fn encode(&self, salt: u8) -> UpdateResult<Bytes> {
        if self.graph_chks.len() > MAX_GRAPH_CHKS {
            return Err(UpdateError::Invariant {
                message: format!("{} graph CHKs in top key", self.graph_chks.len()),
            });
        }

        let mut buf = BytesMut::with_capacity(MAX_TOP_KEY_LEN);
        buf.put_slice(TOP_KEY_MAGIC);
        buf.put_u8(salt);
        buf.put_u8(self.graph_chks.len() as u8);
        for chk in &self.graph_chks {
            buf.put_slice(&chk.to_bytes());
        }

        for update in &self.updates {
            if update.chks.len() > MAX_UPDATE_CHKS {
                return Err(UpdateError::Invariant {
                    message: format!("{} CHKs in one top key update", update.chks.len()),
                });
            }
            if buf.len() + update.encoded_len() > MAX_TOP_KEY_LEN {
                break;
            }
            let length = i64::try_from(update.length).map_err(|_| UpdateError::Invariant {
                message: format!("update length {} out of range", update.length),
            })?;
            buf.put_i64(length);
            buf.put_slice(update.parents.first().unwrap_or(&NULL_REV).as_bytes());
            buf.put_slice(update.heads.first().unwrap_or(&NULL_REV).as_bytes());

            let mut count = update.chks.len() as u8;
            if update.heads.len() != 1 || !update.heads_complete {
                count |= HEADS_TRUNCATED;
            }
            if update.parents.len() > 1 || !update.parents_complete {
                count |= PARENTS_TRUNCATED;
            }
            buf.put_u8(count);
            for chk in &update.chks {
                buf.put_slice(&chk.to_bytes());
            }
        }
        Ok(buf.freeze())
    }

    /// Decode, returning the top-key and its salt.
    pub fn decode(data: &[u8]) -> UpdateResult<(TopKey, u8)> {
        let corrupt = |message: String| UpdateError::TopKeyParse { message };
        if data.len() > MAX_TOP_KEY_LEN {
            return Err(corrupt(format!("{} bytes is too long", data.len())));
        }
        if data.len() < HEADER_LEN || &data[..TOP_KEY_MAGIC.len()] != TOP_KEY_MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let salt = data[TOP_KEY_MAGIC.len()];
        let graph_count = data[TOP_KEY_MAGIC.len() + 1] as usize;
        if graph_count > MAX_GRAPH_CHKS {
            return Err(corrupt(format!("{graph_count} graph CHKs")));
        }

        let mut reader = Reader { data, pos: HEADER_LEN };
        let mut graph_chks = Vec::with_capacity(graph_count);
        for _ in 0..graph_count {
            graph_chks.push(reader.chk()?);
        }

        let mut updates = Vec::new();
        while reader.pos < data.len() {
            let length = i64::from_be_bytes(reader.array::<8>()?);
            let length = u64::try_from(length).map_err(|_| corrupt(format!("negative length {length}")))?;
            let parent = ChangesetId(reader.array::<CHANGESET_ID_LEN>()?);
            let head = ChangesetId(reader.array::<CHANGESET_ID_LEN>()?);
            let [count] = reader.array::<1>()?;
            let chks = (0..(count & CHK_COUNT_MASK)).map(|_| reader.chk()).collect::<UpdateResult<Vec<_>>>()?;
            updates.push(TopKeyUpdate {
                length,
                parents: vec![parent],
                heads: vec![head],
                chks,
                parents_complete: count & PARENTS_TRUNCATED == 0,
                heads_complete: count & HEADS_TRUNCATED == 0,
            });
        }

        Ok((TopKey { graph_chks, updates }, salt))
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> UpdateResult<&'a [u8]> {
        let end = self.pos + len;
        let slice = self.data.get(self.pos..end).ok_or_else(|| UpdateError::TopKeyParse {
            message: format!("truncated at byte {}", self.pos),
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> UpdateResult<[u8; N]> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn chk(&mut self) -> UpdateResult<Chk> {
        let bytes = self.take(CHK_LEN)?;
        Chk::from_bytes(bytes).map_err(|source| UpdateError::TopKeyParse {
            message: source.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TOP_KEY_SALTS;
    use crate::graph::test_support::chk;
    use crate::graph::test_support::rev;

    fn update(n: u8) -> TopKeyUpdate {
        TopKeyUpdate {
            length: 1000 + n as u64,
            parents: vec![rev(n)],
            heads: vec![rev(n + 1)],
            chks: vec![chk(n)],
            parents_complete: true,
            heads_complete: true,
        }
    }

    #[test]
    fn test_round_trip_both_salts() {
        let top = TopKey {
            graph_chks: vec![chk(1), chk(2)],
            updates: vec![update(3), update(4)],
        };
        for salt in TOP_KEY_SALTS {
            let bytes = top.encode(salt).unwrap();
            assert_eq!(&bytes[..8], TOP_KEY_MAGIC);
            assert_eq!(TopKey::decode(&bytes).unwrap(), (top.clone(), salt));
        }
        assert_ne!(top.encode(0x00).unwrap(), top.encode(0xff).unwrap());
    }

    #[test]
    fn test_first_publish_layout() {
        let top = TopKey {
            graph_chks: vec![chk(1), chk(2)],
            updates: vec![TopKeyUpdate {
                length: 500,
                parents: vec![NULL_REV],
                heads: vec![rev(1)],
                chks: vec![chk(3)],
                parents_complete: true,
                heads_complete: true,
            }],
        };
        let bytes = top.encode(0).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 2 * CHK_LEN + UPDATE_HEADER_LEN + CHK_LEN);
        assert_eq!(bytes[HEADER_LEN + 2 * CHK_LEN + UPDATE_HEADER_LEN - 1], 1);
    }

    #[test]
    fn test_truncation_flags() {
        let mut multi = update(1);
        multi.heads.push(rev(9));
        multi.parents.push(rev(8));
        let top = TopKey {
            graph_chks: vec![],
            updates: vec![multi],
        };
        let (decoded, _) = TopKey::decode(&top.encode(0).unwrap()).unwrap();
        let update = &decoded.updates[0];
        assert!(!update.heads_complete);
        assert!(!update.parents_complete);
        assert_eq!(update.heads, vec![rev(2)]);
        assert_eq!(update.parents, vec![rev(1)]);
    }

    #[test]
    fn test_oldest_updates_dropped_to_fit() {
        let top = TopKey {
            graph_chks: vec![chk(1), chk(2)],
            updates: (0..20).map(update).collect(),
        };
        let bytes = top.encode(0xff).unwrap();
        assert!(bytes.len() <= MAX_TOP_KEY_LEN);
        let (decoded, _) = TopKey::decode(&bytes).unwrap();
        assert!(decoded.updates.len() < 20);
        assert_eq!(decoded.updates[..], top.updates[..decoded.updates.len()]);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let top = TopKey {
            graph_chks: vec![chk(1)],
            updates: vec![update(1)],
        };
        let bytes = top.encode(0).unwrap();

        let mut bad_magic = bytes.to_vec();
        bad_magic[0] = b'X';
        assert!(TopKey::decode(&bad_magic).unwrap_err().is_corruption());

        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(TopKey::decode(truncated), Err(UpdateError::TopKeyParse { .. })));

        assert!(TopKey::decode(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_encode_rejects_too_many_graph_chks() {
        let top = TopKey {
            graph_chks: vec![chk(1), chk(2), chk(3)],
            updates: vec![],
        };
        assert!(top.encode(0).is_err());
    }
}
