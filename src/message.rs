//! Handshake records between the Supervisor and the Payload
//!
//! Two unidirectional pipes carry length-prefixed JSON records. Each side is
//! a small state machine that reads exactly the record kind it expects next;
//! any other kind is a fatal protocol error on both sides.
//!
//! Sequence (S = Supervisor, P = Payload):
//!
//! ```text
//!  S→P  ready
//!  P→S  ok
//!  S    newuidmap/newgidmap applied to P's pid externally
//!  S→P  mapping       { RunConfig }
//!  P→S  mapping-ok
//!  S→P  configuration { RunConfig }
//!  S→P  network       { NetParams }   (only when networking is enabled)
//!  S→P  security      { LockdownPolicy }
//! ```

use crate::config::RunConfig;
use crate::network::NetParams;
use crate::policy::LockdownPolicy;
use eyre::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};

/// Pipe endpoints inherited by the Payload
pub const PAYLOAD_RX_FD: RawFd = 3;
pub const PAYLOAD_TX_FD: RawFd = 4;

/// Upper bound on a single record; a config document is a few KiB
const MAX_RECORD_LEN: usize = 1024 * 1024;

/// A framed, self-describing handshake record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum Record {
    Ready,
    Ok,
    Mapping(RunConfig),
    MappingOk,
    Configuration(RunConfig),
    Network(NetParams),
    Security(LockdownPolicy),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Ready => "ready",
            Record::Ok => "ok",
            Record::Mapping(_) => "mapping",
            Record::MappingOk => "mapping-ok",
            Record::Configuration(_) => "configuration",
            Record::Network(_) => "network",
            Record::Security(_) => "security",
        }
    }
}

/// Write one record: 4-byte big-endian length, then the JSON body.
fn write_record<W: Write>(writer: &mut W, record: &Record) -> Result<()> {
    let body = serde_json::to_vec(record).wrap_err("encoding handshake record")?;
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len)?;
    writer.write_all(&body)?;
    writer.flush()?;
    log::trace!("Sent {:?} record ({} bytes)", record.kind(), body.len());
    Ok(())
}

/// Read one record. A short read means the peer died mid-handshake.
fn read_record<R: Read>(reader: &mut R) -> Result<Record> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .wrap_err("handshake pipe closed before a full record arrived")?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_RECORD_LEN {
        bail!("handshake record too large: {} bytes", len);
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .wrap_err("handshake pipe closed mid-record")?;

    serde_json::from_slice(&body).wrap_err("decoding handshake record")
}

/// Read one record and require a specific kind.
fn expect<R: Read>(reader: &mut R, wanted: &'static str) -> Result<Record> {
    let record = read_record(reader)?;
    if record.kind() != wanted {
        bail!(
            "protocol error: got {:?} record, expected {:?}",
            record.kind(),
            wanted
        );
    }
    Ok(record)
}

/// Supervisor half of the handshake
#[derive(Debug)]
pub struct ParentPipe<W = File, R = File> {
    tx: W,
    rx: R,
}

impl<W: Write, R: Read> ParentPipe<W, R> {
    pub fn new(tx: W, rx: R) -> Self {
        Self { tx, rx }
    }

    pub fn send_ready(&mut self) -> Result<()> {
        write_record(&mut self.tx, &Record::Ready)
    }

    pub fn wait_ok(&mut self) -> Result<()> {
        expect(&mut self.rx, "ok").map(|_| ())
    }

    pub fn send_mapping(&mut self, config: &RunConfig) -> Result<()> {
        write_record(&mut self.tx, &Record::Mapping(config.clone()))
    }

    pub fn wait_mapping_ok(&mut self) -> Result<()> {
        expect(&mut self.rx, "mapping-ok").map(|_| ())
    }

    pub fn send_configuration(&mut self, config: &RunConfig) -> Result<()> {
        write_record(&mut self.tx, &Record::Configuration(config.clone()))
    }

    pub fn send_network(&mut self, params: &NetParams) -> Result<()> {
        write_record(&mut self.tx, &Record::Network(params.clone()))
    }

    pub fn send_security(&mut self, policy: &LockdownPolicy) -> Result<()> {
        write_record(&mut self.tx, &Record::Security(policy.clone()))
    }
}

/// Payload half of the handshake
#[derive(Debug)]
pub struct ChildPipe<R = File, W = File> {
    rx: R,
    tx: W,
}

impl ChildPipe<File, File> {
    /// Adopt the pipe endpoints the Supervisor bound to fds 3 and 4.
    ///
    /// # Safety
    ///
    /// Must be called at most once, and only in the re-executed child where
    /// those descriptors are known to be the inherited handshake pipes.
    pub unsafe fn from_inherited_fds() -> Self {
        Self {
            rx: File::from_raw_fd(PAYLOAD_RX_FD),
            tx: File::from_raw_fd(PAYLOAD_TX_FD),
        }
    }
}

impl<R: Read, W: Write> ChildPipe<R, W> {
    pub fn new(rx: R, tx: W) -> Self {
        Self { rx, tx }
    }

    pub fn wait_ready(&mut self) -> Result<()> {
        expect(&mut self.rx, "ready").map(|_| ())
    }

    pub fn send_ok(&mut self) -> Result<()> {
        write_record(&mut self.tx, &Record::Ok)
    }

    pub fn wait_mapping(&mut self) -> Result<RunConfig> {
        match expect(&mut self.rx, "mapping")? {
            Record::Mapping(config) => Ok(config),
            _ => unreachable!(),
        }
    }

    pub fn send_mapping_ok(&mut self) -> Result<()> {
        write_record(&mut self.tx, &Record::MappingOk)
    }

    pub fn wait_configuration(&mut self) -> Result<RunConfig> {
        match expect(&mut self.rx, "configuration")? {
            Record::Configuration(config) => Ok(config),
            _ => unreachable!(),
        }
    }

    pub fn wait_network(&mut self) -> Result<NetParams> {
        match expect(&mut self.rx, "network")? {
            Record::Network(params) => Ok(params),
            _ => unreachable!(),
        }
    }

    pub fn wait_security(&mut self) -> Result<LockdownPolicy> {
        match expect(&mut self.rx, "security")? {
            Record::Security(policy) => Ok(policy),
            _ => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceMode, Workload};
    use std::io::Cursor;
    use std::path::PathBuf;

    fn sample_config() -> RunConfig {
        RunConfig {
            network_enabled: false,
            memory_limit_mib: 64,
            source_path: PathBuf::from("/tmp/app"),
            source_mode: SourceMode::Copy,
            workload: Workload::Command {
                argv: vec!["true".to_string()],
            },
            delete_on_exit: false,
            container_id: "abc123def456".to_string(),
        }
    }

    fn encode(record: &Record) -> Vec<u8> {
        let mut buffer = Vec::new();
        write_record(&mut buffer, record).unwrap();
        buffer
    }

    #[test]
    fn test_record_round_trip() -> Result<()> {
        let encoded = encode(&Record::Mapping(sample_config()));
        let decoded = read_record(&mut Cursor::new(encoded))?;

        match decoded {
            Record::Mapping(config) => assert_eq!(config.container_id, "abc123def456"),
            other => panic!("unexpected record {:?}", other.kind()),
        }
        Ok(())
    }

    #[test]
    fn test_kind_tags_match_wire_names() {
        // The wire tag is the kebab-case kind string.
        let encoded = serde_json::to_string(&Record::MappingOk).unwrap();
        assert!(encoded.contains("\"mapping-ok\""));
        let encoded = serde_json::to_string(&Record::Ready).unwrap();
        assert!(encoded.contains("\"ready\""));
    }

    #[test]
    fn test_unexpected_kind_is_fatal() {
        let encoded = encode(&Record::Ready);
        let err = expect(&mut Cursor::new(encoded), "ok").unwrap_err();
        assert!(err.to_string().contains("protocol error"));
    }

    #[test]
    fn test_short_read_is_fatal() {
        let mut encoded = encode(&Record::Ok);
        encoded.truncate(encoded.len() - 2);
        assert!(read_record(&mut Cursor::new(encoded)).is_err());
    }

    #[test]
    fn test_oversized_record_rejected() {
        let mut framed = Vec::new();
        framed.extend_from_slice(&(MAX_RECORD_LEN as u32 + 1).to_be_bytes());
        assert!(read_record(&mut Cursor::new(framed)).is_err());
    }

    /// Replays the full recorded sequence against the Payload state machine
    /// and checks it consumes exactly the records the Supervisor sends.
    #[test]
    fn test_child_state_machine_replays_full_sequence() -> Result<()> {
        let config = sample_config();
        let policy = LockdownPolicy::default();

        let mut stream = Vec::new();
        stream.extend(encode(&Record::Ready));
        stream.extend(encode(&Record::Mapping(config.clone())));
        stream.extend(encode(&Record::Configuration(config.clone())));
        stream.extend(encode(&Record::Security(policy)));

        let mut child = ChildPipe::new(Cursor::new(stream), Vec::new());

        child.wait_ready()?;
        child.send_ok()?;
        child.wait_mapping()?;
        child.send_mapping_ok()?;
        let received = child.wait_configuration()?;
        assert_eq!(received.container_id, config.container_id);
        child.wait_security()?;

        // No extra reads: the input stream must be fully consumed.
        let ChildPipe { mut rx, tx } = child;
        let mut rest = Vec::new();
        rx.read_to_end(&mut rest)?;
        assert!(rest.is_empty());

        // The child wrote exactly ok + mapping-ok.
        let mut replies = Cursor::new(tx);
        assert_eq!(read_record(&mut replies)?.kind(), "ok");
        assert_eq!(read_record(&mut replies)?.kind(), "mapping-ok");
        Ok(())
    }

    /// A permuted order must abort the state machine.
    #[test]
    fn test_child_rejects_permuted_sequence() {
        let mut stream = Vec::new();
        stream.extend(encode(&Record::Configuration(sample_config())));
        stream.extend(encode(&Record::Ready));

        let mut child = ChildPipe::new(Cursor::new(stream), Vec::new());
        assert!(child.wait_ready().is_err());
    }

    #[test]
    fn test_parent_state_machine_validates_replies() -> Result<()> {
        let mut replies = Vec::new();
        replies.extend(encode(&Record::Ok));
        replies.extend(encode(&Record::MappingOk));

        let mut parent = ParentPipe::new(Vec::new(), Cursor::new(replies));
        parent.send_ready()?;
        parent.wait_ok()?;
        parent.send_mapping(&sample_config())?;
        parent.wait_mapping_ok()?;
        Ok(())
    }
}
