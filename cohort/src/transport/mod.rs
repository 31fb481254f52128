//! TCP point-to-point transport: per-session listeners bound during
//! bootstrap, upgraded into a ranked mesh once the clique is known.

mod mesh;
pub(crate) mod tcp;

pub use mesh::{P2pMesh, StagedTransport, TcpTransport};
