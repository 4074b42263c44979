pub mod approval;
pub mod ledger;
pub mod permissions;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod router;
pub mod server;
pub mod session;

pub use approval::{ApprovalClient, ApprovalSurface};
pub use ledger::{Handoff, PendingRequest, RequestKind};
pub use protocol::{InboundMessage, Message, OutboundMessage, TabId};
pub use provider::{Accounts, Injected, Provider, SignResult, Signer};
pub use relay::{ContentRelay, RelayEvents};
pub use router::{Completion, Router, RouterHandle, SignOutcome, Status};
pub use server::BridgeServer;
pub use session::SessionManager;
