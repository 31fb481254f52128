/// Rank of a worker within a session's clique (0-indexed).
pub type Rank = u32;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Stable identifier of one participating worker (`host:port` or a
/// scheduler-assigned name).
///
/// The order in which a scheduler reports its workers is the order ranks are
/// assigned in; the address itself carries no rank information.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
pub struct WorkerAddress(String);

impl WorkerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for WorkerAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque per-`init()` session token. A destroyed session's id is never
/// handed out again.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).hyphenated())
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// Token shared by every member of one clique so each can join the same
/// collective-communication context. Generated once per session by the
/// coordinator.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
pub struct CliqueId([u8; 16]);

impl CliqueId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Id of the sub-clique for `color` in the `generation`-th split of this
    /// clique. Every member derives the same id without talking.
    pub fn derive(&self, generation: u64, color: u32) -> CliqueId {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        fn fnv(seed: u64, parts: &[&[u8]]) -> u64 {
            parts.iter().flat_map(|p| p.iter()).fold(seed, |h, &b| {
                (h ^ u64::from(b)).wrapping_mul(0x100000001b3)
            })
        }
        let hi = fnv(FNV_OFFSET, &[&self.0, &generation.to_le_bytes(), &color.to_le_bytes()]);
        let lo = fnv(hi, &[&self.0, &[0xff]]);
        let mut id = [0u8; 16];
        id[..8].copy_from_slice(&hi.to_le_bytes());
        id[8..].copy_from_slice(&lo.to_le_bytes());
        CliqueId(id)
    }
}

impl std::fmt::Debug for CliqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The first 4 bytes are enough to tell cliques apart in logs.
        write!(
            f,
            "CliqueId({:02x}{:02x}{:02x}{:02x})",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Element types understood by the collective engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    I8 = 2,
    I32 = 3,
    I64 = 4,
    U8 = 5,
    U32 = 6,
    U64 = 7,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for collective communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}
