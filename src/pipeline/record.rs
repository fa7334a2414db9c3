use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SCHEMA_VERSION: u8 = 1;
pub const RECORD_SIZE: usize = 128;
pub const COMM_LEN: usize = 16;

/// `order` value the kernel uses for a sysrq-forced kill.
pub const SYSRQ_ORDER: i32 = -1;

// Wire offsets (little-endian)
const OFF_VERSION: usize = 0;
const OFF_CONSTRAINT: usize = 1;
const OFF_PRODUCER: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_TIMESTAMP: usize = 12;
const OFF_PID: usize = 20;
const OFF_TGID: usize = 24;
const OFF_COMM: usize = 28;
const OFF_TOTAL_VM: usize = 44;
const OFF_RSS: usize = 52;
const OFF_MEMCG: usize = 60;
const OFF_ORDER: usize = 68;
const OFF_TOTALPAGES: usize = 72;
const OFF_POINTS: usize = 80;
const OFF_UID: usize = 88;
const OFF_SCORE_ADJ: usize = 92;
const OFF_ANON_RSS: usize = 96;
const OFF_FILE_RSS: usize = 104;
const OFF_SHMEM_RSS: usize = 112;
const OFF_PGTABLES: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    None,
    Cpuset,
    MemoryPolicy,
    Memcg,
}

impl Constraint {
    fn as_byte(self) -> u8 {
        match self {
            Constraint::None => 0,
            Constraint::Cpuset => 1,
            Constraint::MemoryPolicy => 2,
            Constraint::Memcg => 3,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Constraint::None),
            1 => Some(Constraint::Cpuset),
            2 => Some(Constraint::MemoryPolicy),
            3 => Some(Constraint::Memcg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    #[default]
    None,
    Partial,
    Complete,
}

/// The task the kernel committed to kill, already translated out of raw kernel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VictimTask {
    pub pid: u32,
    pub tgid: u32,
    #[serde(with = "comm_text")]
    pub comm: [u8; COMM_LEN],
    pub total_vm: u64,
    pub rss: u64,
    /// RSS breakdown in pages. Zero when the hook could not read the counters.
    #[serde(default)]
    pub anon_rss: u64,
    #[serde(default)]
    pub file_rss: u64,
    #[serde(default)]
    pub shmem_rss: u64,
    #[serde(default)]
    pub pgtables_bytes: u64,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub oom_score_adj: i16,
}

impl VictimTask {
    pub fn new(pid: u32, tgid: u32, comm: &str, total_vm: u64, rss: u64) -> Self {
        Self {
            pid,
            tgid,
            comm: comm_bytes(comm),
            total_vm,
            rss,
            anon_rss: 0,
            file_rss: 0,
            shmem_rss: 0,
            pgtables_bytes: 0,
            uid: 0,
            oom_score_adj: 0,
        }
    }

    pub fn with_rss_breakdown(mut self, anon: u64, file: u64, shmem: u64) -> Self {
        self.anon_rss = anon;
        self.file_rss = file;
        self.shmem_rss = shmem;
        self
    }
}

/// Decision context handed over by the instrumentation point.
///
/// Mirrors the parts of the kernel's `oom_control` the pipeline cares about.
/// `chosen` is `None` when the hook fired on a path where no victim was selected.
/// A zero `timestamp_ns` is stamped by `RecordProducer::submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OomDecision {
    #[serde(default)]
    pub timestamp_ns: u64,
    pub chosen: Option<VictimTask>,
    #[serde(default)]
    pub memcg_id: u64,
    pub constraint: Constraint,
    pub order: i32,
    #[serde(default)]
    pub totalpages: u64,
    #[serde(default)]
    pub chosen_points: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("decision context has no chosen victim")]
    NoVictim,
    #[error("victim pid must be positive")]
    InvalidPid,
    #[error("memcg constraint reported for a global-scope oom")]
    ScopeMismatch,
    #[error("order {0} is below the sysrq marker")]
    InvalidOrder(i32),
}

/// Reasons a record pulled off the transport is discarded as corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("record is {0} bytes, expected {}", RECORD_SIZE)]
    Length(usize),
    #[error("unsupported schema version {0}")]
    Version(u8),
    #[error("unknown constraint byte {0}")]
    Constraint(u8),
    #[error("victim pid is zero")]
    ZeroPid,
    #[error("memcg constraint reported for a global-scope oom")]
    ScopeMismatch,
    #[error("comm is not NUL-terminated")]
    UnterminatedComm,
    #[error("order {0} is below the sysrq marker")]
    InvalidOrder(i32),
}

/// Victim memory at kill time. Page counts except `pgtables_bytes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub total_vm: u64,
    pub rss: u64,
    pub anon_rss: u64,
    pub file_rss: u64,
    pub shmem_rss: u64,
    pub pgtables_bytes: u64,
}

/// Fully decoded (and later enriched) OOM kill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OomEvent {
    pub timestamp_ns: u64,
    pub producer: u16,
    pub seq: u64,
    pub victim_pid: u32,
    pub victim_tgid: u32,
    /// Raw task name, NUL-padded. The kernel does not promise UTF-8.
    #[serde(with = "comm_text")]
    pub comm: [u8; COMM_LEN],
    pub total_vm: u64,
    pub rss: u64,
    pub anon_rss: u64,
    pub file_rss: u64,
    pub shmem_rss: u64,
    pub pgtables_bytes: u64,
    pub memcg_id: u64,
    pub constraint: Constraint,
    pub order: i32,
    pub totalpages: u64,
    /// `None` for sysrq kills, where no scoring took place.
    pub chosen_points: Option<i64>,
    pub uid: u32,
    pub oom_score_adj: i16,
    pub cgroup_path: Option<String>,
    pub container_id: Option<String>,
    pub enrichment_status: EnrichmentStatus,
}

impl OomEvent {
    pub fn is_sysrq(&self) -> bool {
        self.order == SYSRQ_ORDER
    }

    pub fn is_global(&self) -> bool {
        self.memcg_id == 0
    }

    pub fn rss_bytes(&self, page_size: u64) -> u64 {
        self.rss.saturating_mul(page_size)
    }

    pub fn total_vm_bytes(&self, page_size: u64) -> u64 {
        self.total_vm.saturating_mul(page_size)
    }

    /// Bytes up to the terminator.
    pub fn comm_bytes(&self) -> &[u8] {
        &self.comm[..comm_len(&self.comm)]
    }

    /// Task name for display; invalid UTF-8 is replaced.
    pub fn comm_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.comm_bytes())
    }

    pub fn memory(&self) -> MemoryUsage {
        MemoryUsage {
            total_vm: self.total_vm,
            rss: self.rss,
            anon_rss: self.anon_rss,
            file_rss: self.file_rss,
            shmem_rss: self.shmem_rss,
            pgtables_bytes: self.pgtables_bytes,
        }
    }
}

/// Serialize a decision into `buf`.
///
/// Runs in the instrumentation context: no allocation, no locking, and on
/// error `buf` must not be submitted.
pub fn encode(
    decision: &OomDecision,
    producer: u16,
    seq: u64,
    buf: &mut [u8; RECORD_SIZE],
) -> Result<(), EncodingError> {
    let victim = decision.chosen.as_ref().ok_or(EncodingError::NoVictim)?;
    if victim.pid == 0 {
        return Err(EncodingError::InvalidPid);
    }
    if decision.memcg_id == 0 && decision.constraint == Constraint::Memcg {
        return Err(EncodingError::ScopeMismatch);
    }
    if decision.order < SYSRQ_ORDER {
        return Err(EncodingError::InvalidOrder(decision.order));
    }

    buf.fill(0);
    buf[OFF_VERSION] = SCHEMA_VERSION;
    buf[OFF_CONSTRAINT] = decision.constraint.as_byte();
    put(buf, OFF_PRODUCER, producer.to_le_bytes());
    put(buf, OFF_SEQ, seq.to_le_bytes());
    put(buf, OFF_TIMESTAMP, decision.timestamp_ns.to_le_bytes());
    put(buf, OFF_PID, victim.pid.to_le_bytes());
    put(buf, OFF_TGID, victim.tgid.to_le_bytes());

    // Last comm byte stays zero so the terminator always survives.
    let name_len = comm_len(&victim.comm).min(COMM_LEN - 1);
    buf[OFF_COMM..OFF_COMM + name_len].copy_from_slice(&victim.comm[..name_len]);

    put(buf, OFF_TOTAL_VM, victim.total_vm.to_le_bytes());
    put(buf, OFF_RSS, victim.rss.to_le_bytes());
    put(buf, OFF_MEMCG, decision.memcg_id.to_le_bytes());
    put(buf, OFF_ORDER, decision.order.to_le_bytes());
    put(buf, OFF_TOTALPAGES, decision.totalpages.to_le_bytes());
    if decision.order != SYSRQ_ORDER {
        put(buf, OFF_POINTS, decision.chosen_points.to_le_bytes());
    }
    put(buf, OFF_UID, victim.uid.to_le_bytes());
    put(buf, OFF_SCORE_ADJ, victim.oom_score_adj.to_le_bytes());
    put(buf, OFF_ANON_RSS, victim.anon_rss.to_le_bytes());
    put(buf, OFF_FILE_RSS, victim.file_rss.to_le_bytes());
    put(buf, OFF_SHMEM_RSS, victim.shmem_rss.to_le_bytes());
    put(buf, OFF_PGTABLES, victim.pgtables_bytes.to_le_bytes());
    Ok(())
}

pub fn decode(bytes: &[u8]) -> Result<OomEvent, DecodeError> {
    let buf: &[u8; RECORD_SIZE] = bytes
        .try_into()
        .map_err(|_| DecodeError::Length(bytes.len()))?;

    if buf[OFF_VERSION] != SCHEMA_VERSION {
        return Err(DecodeError::Version(buf[OFF_VERSION]));
    }
    let constraint = Constraint::from_byte(buf[OFF_CONSTRAINT])
        .ok_or(DecodeError::Constraint(buf[OFF_CONSTRAINT]))?;

    let victim_pid = u32::from_le_bytes(take(buf, OFF_PID));
    if victim_pid == 0 {
        return Err(DecodeError::ZeroPid);
    }
    let memcg_id = u64::from_le_bytes(take(buf, OFF_MEMCG));
    if memcg_id == 0 && constraint == Constraint::Memcg {
        return Err(DecodeError::ScopeMismatch);
    }
    let order = i32::from_le_bytes(take(buf, OFF_ORDER));
    if order < SYSRQ_ORDER {
        return Err(DecodeError::InvalidOrder(order));
    }

    let comm: [u8; COMM_LEN] = take(buf, OFF_COMM);
    if !comm.contains(&0) {
        return Err(DecodeError::UnterminatedComm);
    }

    let chosen_points = if order == SYSRQ_ORDER {
        None
    } else {
        Some(i64::from_le_bytes(take(buf, OFF_POINTS)))
    };

    Ok(OomEvent {
        timestamp_ns: u64::from_le_bytes(take(buf, OFF_TIMESTAMP)),
        producer: u16::from_le_bytes(take(buf, OFF_PRODUCER)),
        seq: u64::from_le_bytes(take(buf, OFF_SEQ)),
        victim_pid,
        victim_tgid: u32::from_le_bytes(take(buf, OFF_TGID)),
        comm,
        total_vm: u64::from_le_bytes(take(buf, OFF_TOTAL_VM)),
        rss: u64::from_le_bytes(take(buf, OFF_RSS)),
        anon_rss: u64::from_le_bytes(take(buf, OFF_ANON_RSS)),
        file_rss: u64::from_le_bytes(take(buf, OFF_FILE_RSS)),
        shmem_rss: u64::from_le_bytes(take(buf, OFF_SHMEM_RSS)),
        pgtables_bytes: u64::from_le_bytes(take(buf, OFF_PGTABLES)),
        memcg_id,
        constraint,
        order,
        totalpages: u64::from_le_bytes(take(buf, OFF_TOTALPAGES)),
        chosen_points,
        uid: u32::from_le_bytes(take(buf, OFF_UID)),
        oom_score_adj: i16::from_le_bytes(take(buf, OFF_SCORE_ADJ)),
        cgroup_path: None,
        container_id: None,
        enrichment_status: EnrichmentStatus::None,
    })
}

fn put<const N: usize>(buf: &mut [u8; RECORD_SIZE], offset: usize, bytes: [u8; N]) {
    buf[offset..offset + N].copy_from_slice(&bytes);
}

fn take<const N: usize>(buf: &[u8; RECORD_SIZE], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

/// Truncating copy into a fixed comm buffer, keeping room for the terminator.
pub fn comm_bytes(name: &str) -> [u8; COMM_LEN] {
    let mut out = [0u8; COMM_LEN];
    let len = name.len().min(COMM_LEN - 1);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

fn comm_len(comm: &[u8; COMM_LEN]) -> usize {
    comm.iter().position(|&b| b == 0).unwrap_or(COMM_LEN)
}

// comm travels as text in JSON (injector input, logs)
mod comm_text {
    use super::{comm_bytes, comm_len, COMM_LEN};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(comm: &[u8; COMM_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(&comm[..comm_len(comm)]))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; COMM_LEN], D::Error> {
        let name = String::deserialize(d)?;
        Ok(comm_bytes(&name))
    }
}
