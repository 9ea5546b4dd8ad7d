//! Research API access: the transport boundary and the free endpoints

pub mod research;
pub mod transport;

pub use research::{DiscoveryDocument, ResearchApi, DEFAULT_BASE_URL};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
