//! Binary wire format for the messages exchanged between group members.
//!
//! Every integer is little-endian. The append-entry header is covered by a short
//! SHA3 digest so that any corrupted header byte is rejected; entry payloads are
//! only framed, interpreting them is the state machine's job.
//!
//! Append-entry layout:
//!
//! ```text
//! 0        8        16       24       32       40 41  43       47
//! | leader | term   | commit | pterm  | pindex |r | n | digest | entries...
//! ```
//!
//! Byte 40 is reserved. It is always written as zero, is not covered by the
//! digest and is ignored on decode, leaving room for a future flags field.
//! Each entry is `u32 len | u64 term | u8 kind | data` where `len` counts the
//! bytes after itself.

use std::borrow::Cow;

use bytes::{Buf, BufMut};
use digest::Digest;
use sha3::Sha3_256;

use crate::raft::entry::{Entry, EntryKind};
use crate::raft::error::CodecError;
use crate::raft::{PeerId, ID_LEN};

/// Size of the fixed append-entry header.
pub const APPEND_ENTRY_HEADER_LEN: usize = 47;
/// Offset of the reserved header byte that is never validated.
pub const RESERVED_BYTE_OFFSET: usize = 40;
const COUNT_OFFSET: usize = 41;
const DIGEST_OFFSET: usize = 43;
const DIGEST_LEN: usize = 4;
const ENTRY_LEN_SIZE: usize = 4;
const ENTRY_HEADER_LEN: usize = 9; // term + kind

const VOTE_REQUEST_LEN: usize = 24 + ID_LEN;
const VOTE_RESPONSE_LEN: usize = 8 + ID_LEN + 1;
const APPEND_ENTRY_RESPONSE_LEN: usize = 16 + ID_LEN + 1;
const TIMEOUT_NOW_LEN: usize = 8 + ID_LEN;
const INSTALL_SNAPSHOT_HEADER_LEN: usize = ID_LEN + 24;

/// The replication unit sent by a leader. An empty `entries` is a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendEntry {
    /// Leader id, or empty when there is no leader.
    pub leader: String,
    pub term: u64,
    /// Leader's commit index.
    pub commit: u64,
    /// Term of the entry at `pindex`.
    pub pterm: u64,
    /// Index of the entry preceding `entries`.
    pub pindex: u64,
    pub entries: Vec<Entry>,
}

impl AppendEntry {
    pub fn leader_id(&self) -> Option<PeerId> {
        PeerId::new(self.leader.clone()).ok()
    }

    /// Number of bytes [`AppendEntry::encode`] produces.
    pub fn encoded_len(&self) -> usize {
        APPEND_ENTRY_HEADER_LEN
            + self
                .entries
                .iter()
                .map(|e| ENTRY_LEN_SIZE + ENTRY_HEADER_LEN + e.data.len())
                .sum::<usize>()
    }

    fn validate(&self) -> Result<(), CodecError> {
        let leader = self.leader.as_bytes();
        if !leader.is_empty() {
            if leader.len() != ID_LEN {
                return Err(CodecError::LeaderFieldLength(leader.len()));
            }
            // Same rule as `PeerId`, so anything that encodes also decodes.
            if !leader.iter().all(u8::is_ascii_graphic) {
                return Err(CodecError::MalformedMessage("invalid peer id"));
            }
        }
        if self.entries.len() > u16::MAX as usize {
            return Err(CodecError::TooManyEntries(self.entries.len()));
        }
        if self
            .entries
            .iter()
            .any(|e| e.data.len() > (u32::MAX as usize) - ENTRY_HEADER_LEN)
        {
            return Err(CodecError::MalformedMessage("entry too large"));
        }
        Ok(())
    }

    /// Encodes the message.
    ///
    /// When `scratch` is large enough the message is written into it and a view
    /// of it is returned. Otherwise fresh storage is allocated and `scratch` is
    /// left untouched.
    pub fn encode<'a>(&self, scratch: Option<&'a mut [u8]>) -> Result<Cow<'a, [u8]>, CodecError> {
        self.validate()?;
        let size = self.encoded_len();
        match scratch {
            Some(buf) if buf.len() >= size => {
                let (head, _) = buf.split_at_mut(size);
                self.write_into(head);
                Ok(Cow::Borrowed(head))
            }
            _ => {
                let mut buf = vec![0u8; size];
                self.write_into(&mut buf);
                Ok(Cow::Owned(buf))
            }
        }
    }

    /// `buf` must be exactly `encoded_len()` bytes.
    fn write_into(&self, buf: &mut [u8]) {
        let mut w = &mut buf[..];
        if self.leader.is_empty() {
            w.put_bytes(0, ID_LEN);
        } else {
            w.put_slice(self.leader.as_bytes());
        }
        w.put_u64_le(self.term);
        w.put_u64_le(self.commit);
        w.put_u64_le(self.pterm);
        w.put_u64_le(self.pindex);
        w.put_u8(0);
        w.put_u16_le(self.entries.len() as u16);
        w.put_bytes(0, DIGEST_LEN);
        for e in &self.entries {
            w.put_u32_le((ENTRY_HEADER_LEN + e.data.len()) as u32);
            w.put_u64_le(e.term);
            w.put_u8(e.kind as u8);
            w.put_slice(&e.data);
        }
        let digest = header_digest(buf);
        buf[DIGEST_OFFSET..DIGEST_OFFSET + DIGEST_LEN].copy_from_slice(&digest);
    }

    pub fn decode(buf: &[u8]) -> Result<AppendEntry, CodecError> {
        if buf.len() < APPEND_ENTRY_HEADER_LEN {
            return Err(CodecError::MalformedMessage("short append entry header"));
        }
        if header_digest(buf) != buf[DIGEST_OFFSET..DIGEST_OFFSET + DIGEST_LEN] {
            return Err(CodecError::MalformedMessage("append entry header digest mismatch"));
        }

        let mut r = buf;
        let leader = PeerId::from_wire(take(&mut r, ID_LEN)?)?
            .map(String::from)
            .unwrap_or_default();
        // fixed-size header, length checked above
        let term = r.get_u64_le();
        let commit = r.get_u64_le();
        let pterm = r.get_u64_le();
        let pindex = r.get_u64_le();
        r.advance(1); // reserved
        let count = r.get_u16_le() as usize;
        r.advance(DIGEST_LEN);

        if pterm > term {
            return Err(CodecError::MalformedMessage("pterm ahead of term"));
        }

        let max_entries = r.remaining() / (ENTRY_LEN_SIZE + ENTRY_HEADER_LEN);
        let mut entries = Vec::with_capacity(count.min(max_entries));
        let mut last_term = pterm;
        for _ in 0..count {
            ensure(r, ENTRY_LEN_SIZE)?;
            let len = r.get_u32_le() as usize;
            if len < ENTRY_HEADER_LEN {
                return Err(CodecError::MalformedMessage("entry shorter than its header"));
            }
            let mut body = take(&mut r, len)?;
            let eterm = body.get_u64_le();
            let kind = EntryKind::from_u8(body.get_u8())
                .ok_or(CodecError::MalformedMessage("unknown entry kind"))?;
            if eterm > term || eterm < last_term {
                return Err(CodecError::MalformedMessage("entry term out of range"));
            }
            last_term = eterm;
            entries.push(Entry::new(eterm, kind, body.to_vec()));
        }
        if r.has_remaining() {
            return Err(CodecError::MalformedMessage("trailing bytes after entries"));
        }

        Ok(AppendEntry {
            leader,
            term,
            commit,
            pterm,
            pindex,
            entries,
        })
    }
}

/// First bytes of SHA3-256 over the header, skipping the reserved byte and the digest itself.
fn header_digest(buf: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha3_256::new();
    hasher.update(&buf[..RESERVED_BYTE_OFFSET]);
    hasher.update(&buf[COUNT_OFFSET..DIGEST_OFFSET]);
    let full = hasher.finalize();
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&full[..DIGEST_LEN]);
    out
}

/// Follower's answer to an [`AppendEntry`].
///
/// On success `index` is the last index now matching the leader. On failure it
/// is a hint the leader retreats its cursor to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntryResponse {
    pub term: u64,
    pub index: u64,
    pub peer: PeerId,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: u64,
    pub last_term: u64,
    pub last_index: u64,
    pub candidate: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: u64,
    pub peer: PeerId,
    pub granted: bool,
}

/// Sent by a leader that steps down, asking the chosen successor to campaign now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutNow {
    pub term: u64,
    pub leader: PeerId,
}

/// Leader state machine image for a follower whose missing entries were compacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshot {
    pub leader: PeerId,
    pub term: u64,
    pub last_index: u64,
    pub last_term: u64,
    pub data: Vec<u8>,
}

/// Proposal relayed by a follower to the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardProposal {
    pub from: PeerId,
    pub data: Vec<u8>,
}

/// Every message a member can receive, framed by a one-byte tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rpc {
    AppendEntry(AppendEntry),
    AppendEntryResponse(AppendEntryResponse),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    TimeoutNow(TimeoutNow),
    InstallSnapshot(InstallSnapshot),
    ForwardProposal(ForwardProposal),
}

const TAG_APPEND_ENTRY: u8 = 1;
const TAG_APPEND_ENTRY_RESPONSE: u8 = 2;
const TAG_VOTE_REQUEST: u8 = 3;
const TAG_VOTE_RESPONSE: u8 = 4;
const TAG_TIMEOUT_NOW: u8 = 5;
const TAG_INSTALL_SNAPSHOT: u8 = 6;
const TAG_FORWARD_PROPOSAL: u8 = 7;

impl Rpc {
    pub fn kind(&self) -> &'static str {
        match self {
            Rpc::AppendEntry(_) => "append_entry",
            Rpc::AppendEntryResponse(_) => "append_entry_response",
            Rpc::VoteRequest(_) => "vote_request",
            Rpc::VoteResponse(_) => "vote_response",
            Rpc::TimeoutNow(_) => "timeout_now",
            Rpc::InstallSnapshot(_) => "install_snapshot",
            Rpc::ForwardProposal(_) => "forward_proposal",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            Rpc::AppendEntry(ae) => {
                let mut buf = vec![0u8; 1 + ae.encoded_len()];
                buf[0] = TAG_APPEND_ENTRY;
                ae.encode(Some(&mut buf[1..]))?;
                Ok(buf)
            }
            Rpc::AppendEntryResponse(r) => {
                let mut buf = Vec::with_capacity(1 + APPEND_ENTRY_RESPONSE_LEN);
                buf.put_u8(TAG_APPEND_ENTRY_RESPONSE);
                buf.put_u64_le(r.term);
                buf.put_u64_le(r.index);
                buf.put_slice(r.peer.as_bytes());
                buf.put_u8(r.success as u8);
                Ok(buf)
            }
            Rpc::VoteRequest(v) => {
                let mut buf = Vec::with_capacity(1 + VOTE_REQUEST_LEN);
                buf.put_u8(TAG_VOTE_REQUEST);
                buf.put_u64_le(v.term);
                buf.put_u64_le(v.last_term);
                buf.put_u64_le(v.last_index);
                buf.put_slice(v.candidate.as_bytes());
                Ok(buf)
            }
            Rpc::VoteResponse(v) => {
                let mut buf = Vec::with_capacity(1 + VOTE_RESPONSE_LEN);
                buf.put_u8(TAG_VOTE_RESPONSE);
                buf.put_u64_le(v.term);
                buf.put_slice(v.peer.as_bytes());
                buf.put_u8(v.granted as u8);
                Ok(buf)
            }
            Rpc::TimeoutNow(t) => {
                let mut buf = Vec::with_capacity(1 + TIMEOUT_NOW_LEN);
                buf.put_u8(TAG_TIMEOUT_NOW);
                buf.put_u64_le(t.term);
                buf.put_slice(t.leader.as_bytes());
                Ok(buf)
            }
            Rpc::InstallSnapshot(s) => {
                let mut buf = Vec::with_capacity(1 + INSTALL_SNAPSHOT_HEADER_LEN + s.data.len());
                buf.put_u8(TAG_INSTALL_SNAPSHOT);
                buf.put_slice(s.leader.as_bytes());
                buf.put_u64_le(s.term);
                buf.put_u64_le(s.last_index);
                buf.put_u64_le(s.last_term);
                buf.put_slice(&s.data);
                Ok(buf)
            }
            Rpc::ForwardProposal(p) => {
                let mut buf = Vec::with_capacity(1 + ID_LEN + p.data.len());
                buf.put_u8(TAG_FORWARD_PROPOSAL);
                buf.put_slice(p.from.as_bytes());
                buf.put_slice(&p.data);
                Ok(buf)
            }
        }
    }

    /// Fixed-size bodies are length checked up front, so the getters below never run dry.
    pub fn decode(buf: &[u8]) -> Result<Rpc, CodecError> {
        let (tag, body) = buf
            .split_first()
            .ok_or(CodecError::MalformedMessage("empty message"))?;
        match *tag {
            TAG_APPEND_ENTRY => Ok(Rpc::AppendEntry(AppendEntry::decode(body)?)),
            TAG_APPEND_ENTRY_RESPONSE => {
                let mut r = exact(body, APPEND_ENTRY_RESPONSE_LEN)?;
                Ok(Rpc::AppendEntryResponse(AppendEntryResponse {
                    term: r.get_u64_le(),
                    index: r.get_u64_le(),
                    peer: peer(&mut r)?,
                    success: boolean(&mut r)?,
                }))
            }
            TAG_VOTE_REQUEST => {
                let mut r = exact(body, VOTE_REQUEST_LEN)?;
                Ok(Rpc::VoteRequest(VoteRequest {
                    term: r.get_u64_le(),
                    last_term: r.get_u64_le(),
                    last_index: r.get_u64_le(),
                    candidate: peer(&mut r)?,
                }))
            }
            TAG_VOTE_RESPONSE => {
                let mut r = exact(body, VOTE_RESPONSE_LEN)?;
                Ok(Rpc::VoteResponse(VoteResponse {
                    term: r.get_u64_le(),
                    peer: peer(&mut r)?,
                    granted: boolean(&mut r)?,
                }))
            }
            TAG_TIMEOUT_NOW => {
                let mut r = exact(body, TIMEOUT_NOW_LEN)?;
                Ok(Rpc::TimeoutNow(TimeoutNow {
                    term: r.get_u64_le(),
                    leader: peer(&mut r)?,
                }))
            }
            TAG_INSTALL_SNAPSHOT => {
                if body.len() < INSTALL_SNAPSHOT_HEADER_LEN {
                    return Err(CodecError::MalformedMessage("short install snapshot"));
                }
                let mut r = body;
                Ok(Rpc::InstallSnapshot(InstallSnapshot {
                    leader: peer(&mut r)?,
                    term: r.get_u64_le(),
                    last_index: r.get_u64_le(),
                    last_term: r.get_u64_le(),
                    data: r.to_vec(),
                }))
            }
            TAG_FORWARD_PROPOSAL => {
                if body.len() < ID_LEN {
                    return Err(CodecError::MalformedMessage("short forwarded proposal"));
                }
                let mut r = body;
                Ok(Rpc::ForwardProposal(ForwardProposal {
                    from: peer(&mut r)?,
                    data: r.to_vec(),
                }))
            }
            _ => Err(CodecError::MalformedMessage("unknown message tag")),
        }
    }
}

/// Running off the end is a malformed message, never a panic in a `Buf` getter.
fn ensure(r: &[u8], n: usize) -> Result<(), CodecError> {
    if r.remaining() < n {
        return Err(CodecError::MalformedMessage("truncated message"));
    }
    Ok(())
}

fn exact(body: &[u8], len: usize) -> Result<&[u8], CodecError> {
    if body.len() != len {
        return Err(CodecError::MalformedMessage("unexpected message length"));
    }
    Ok(body)
}

fn take<'a>(r: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    ensure(*r, n)?;
    let whole: &'a [u8] = *r;
    let out = &whole[..n];
    r.advance(n);
    Ok(out)
}

fn peer(r: &mut &[u8]) -> Result<PeerId, CodecError> {
    PeerId::from_wire(take(r, ID_LEN)?)?.ok_or(CodecError::MalformedMessage("missing peer id"))
}

fn boolean(r: &mut &[u8]) -> Result<bool, CodecError> {
    ensure(*r, 1)?;
    match r.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(CodecError::MalformedMessage("invalid boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn sample() -> AppendEntry {
        AppendEntry {
            leader: "12345678".to_string(),
            term: 3,
            commit: 7,
            pterm: 2,
            pindex: 9,
            entries: vec![
                Entry::new(2, EntryKind::Normal, b"first".to_vec()),
                Entry::new(3, EntryKind::LeaderChange, b"12345678".to_vec()),
                Entry::new(3, EntryKind::Normal, Vec::new()),
            ],
        }
    }

    #[test]
    fn test_encode_leader_length() {
        let mut ae = AppendEntry {
            term: 1,
            ..Default::default()
        };

        ae.leader = "foo_bar_baz".to_string();
        assert_eq!(ae.encode(None), Err(CodecError::LeaderFieldLength(11)));

        ae.leader = String::new();
        assert!(ae.encode(None).is_ok());

        ae.leader = "DEREK123".to_string();
        assert!(ae.encode(None).is_ok());

        // Right length but not a valid member id: refused before anything is written.
        for bad in ["DEREK 23", "\0\0\0\0\0\0\0\0", "\u{e4}\u{e4}\u{e4}\u{e4}"] {
            ae.leader = bad.to_string();
            assert_eq!(ae.leader.len(), ID_LEN);
            let mut scratch = [0u8; 64];
            assert_eq!(
                ae.encode(Some(&mut scratch[..])),
                Err(CodecError::MalformedMessage("invalid peer id")),
                "{:?}",
                bad
            );
            assert!(scratch.iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_encode_buffer_reuse() {
        let ae = AppendEntry {
            leader: "DEREK123".to_string(),
            term: 1,
            ..Default::default()
        };

        let mut small = [0u8; 32];
        let out = ae.encode(Some(&mut small[..])).unwrap();
        assert!(matches!(out, Cow::Owned(_)));
        assert_eq!(out.len(), APPEND_ENTRY_HEADER_LEN);
        assert!(small.iter().all(|b| *b == 0));

        let mut bigger = [0u8; 64];
        let out = ae.encode(Some(&mut bigger[..])).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out.len(), APPEND_ENTRY_HEADER_LEN);
        assert_eq!(bigger[0], b'D');
        assert_eq!(AppendEntry::decode(&bigger[..APPEND_ENTRY_HEADER_LEN]).unwrap(), ae);
    }

    #[test]
    fn test_encode_too_many_entries() {
        let ae = AppendEntry {
            term: 1,
            entries: vec![Entry::new(1, EntryKind::Normal, Vec::new()); u16::MAX as usize + 1],
            ..Default::default()
        };
        let mut scratch = [0u8; 64];
        assert_eq!(
            ae.encode(Some(&mut scratch[..])),
            Err(CodecError::TooManyEntries(u16::MAX as usize + 1))
        );
        assert!(scratch.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_round_trip() {
        let ae = sample();
        let buf = ae.encode(None).unwrap();
        assert_eq!(buf.len(), ae.encoded_len());
        assert_eq!(AppendEntry::decode(&buf).unwrap(), ae);

        let heartbeat = AppendEntry {
            term: 4,
            commit: 2,
            pterm: 4,
            pindex: 2,
            ..Default::default()
        };
        let buf = heartbeat.encode(None).unwrap();
        assert_eq!(AppendEntry::decode(&buf).unwrap(), heartbeat);

        for leader in ["DEREK123", "~!@#$%^&", "a-b_c.d/"] {
            let ae = AppendEntry {
                leader: leader.to_string(),
                ..sample()
            };
            let buf = ae.encode(None).unwrap();
            assert_eq!(AppendEntry::decode(&buf).unwrap(), ae);
        }
        for leader in ["DEREK 23", "\0\0\0\0\0\0\0\0"] {
            let ae = AppendEntry {
                leader: leader.to_string(),
                ..sample()
            };
            assert!(ae.encode(None).is_err(), "{:?}", leader);
        }
    }

    #[test]
    fn test_decode_max_entries_and_truncation() {
        let ae = AppendEntry {
            leader: "12345678".to_string(),
            term: 1,
            entries: vec![Entry::new(1, EntryKind::Normal, Vec::new()); u16::MAX as usize],
            ..Default::default()
        };
        let buf = ae.encode(None).unwrap();
        assert_eq!(AppendEntry::decode(&buf).unwrap().entries.len(), u16::MAX as usize);

        let short = &buf[..buf.len() - 1024];
        assert!(matches!(
            AppendEntry::decode(short),
            Err(CodecError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_decode_every_truncation() {
        let buf = sample().encode(None).unwrap();
        for len in 0..buf.len() {
            assert!(
                matches!(AppendEntry::decode(&buf[..len]), Err(CodecError::MalformedMessage(_))),
                "truncation to {} bytes was accepted",
                len
            );
        }
    }

    #[test]
    fn test_decode_header_corruption() {
        let buf = sample().encode(None).unwrap().into_owned();
        for i in 0..APPEND_ENTRY_HEADER_LEN {
            for flip in [0x01u8, 0x80, 0xff] {
                let mut b = buf.clone();
                b[i] ^= flip;
                let res = AppendEntry::decode(&b);
                if i == RESERVED_BYTE_OFFSET {
                    assert_eq!(res.unwrap(), sample());
                } else {
                    assert!(
                        matches!(res, Err(CodecError::MalformedMessage(_))),
                        "corrupted header byte {} was accepted",
                        i
                    );
                }
            }
        }
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut buf = sample().encode(None).unwrap().into_owned();
        buf.push(0);
        assert!(AppendEntry::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_entry_length_corruption() {
        let ae = AppendEntry {
            leader: "12345678".to_string(),
            term: 1,
            entries: vec![Entry::new(1, EntryKind::Normal, Vec::new()); 64],
            ..Default::default()
        };
        let buf = ae.encode(None).unwrap().into_owned();
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let mut b = buf.clone();
            // each entry starts with its length field; zero one of them
            let entry = rng.gen_range(0..ae.entries.len());
            let at = APPEND_ENTRY_HEADER_LEN + entry * (ENTRY_LEN_SIZE + ENTRY_HEADER_LEN);
            b[at] = 0;
            assert!(matches!(
                AppendEntry::decode(&b),
                Err(CodecError::MalformedMessage(_))
            ));
        }
    }

    #[test]
    fn test_decode_random_bytes_never_panics() {
        let mut rng = rand::thread_rng();
        let buf = sample().encode(None).unwrap().into_owned();
        for _ in 0..1000 {
            let mut b = buf.clone();
            let at = rng.gen_range(0..b.len());
            b[at] = rng.gen();
            let _ = AppendEntry::decode(&b);
            let len = rng.gen_range(0..128);
            let noise: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let _ = Rpc::decode(&noise);
        }
    }

    #[test]
    fn test_rpc_round_trip() {
        let a = PeerId::new("AAAAAAAA").unwrap();
        let b = PeerId::new("BBBBBBBB").unwrap();
        let rpcs = vec![
            Rpc::AppendEntry(sample()),
            Rpc::AppendEntryResponse(AppendEntryResponse {
                term: 3,
                index: 12,
                peer: b.clone(),
                success: true,
            }),
            Rpc::VoteRequest(VoteRequest {
                term: 4,
                last_term: 3,
                last_index: 12,
                candidate: a.clone(),
            }),
            Rpc::VoteResponse(VoteResponse {
                term: 4,
                peer: b.clone(),
                granted: false,
            }),
            Rpc::TimeoutNow(TimeoutNow {
                term: 4,
                leader: a.clone(),
            }),
            Rpc::InstallSnapshot(InstallSnapshot {
                leader: a.clone(),
                term: 4,
                last_index: 100,
                last_term: 3,
                data: vec![1, 2, 3],
            }),
            Rpc::ForwardProposal(ForwardProposal {
                from: b,
                data: vec![9; 8],
            }),
        ];
        for rpc in rpcs {
            let buf = rpc.encode().unwrap();
            assert_eq!(Rpc::decode(&buf).unwrap(), rpc, "{}", rpc.kind());
        }
    }

    #[test]
    fn test_rpc_rejects_bad_framing() {
        assert!(Rpc::decode(&[]).is_err());
        assert!(Rpc::decode(&[42, 0, 0]).is_err());

        let vote = Rpc::VoteResponse(VoteResponse {
            term: 1,
            peer: PeerId::new("AAAAAAAA").unwrap(),
            granted: true,
        })
        .encode()
        .unwrap();
        assert!(Rpc::decode(&vote[..vote.len() - 1]).is_err());

        let mut bad_bool = vote.clone();
        let last = bad_bool.len() - 1;
        bad_bool[last] = 7;
        assert!(Rpc::decode(&bad_bool).is_err());
    }
}
