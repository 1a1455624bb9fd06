//! SOCKS5 bytestream relay: candidates, proxies and winner selection

mod candidates;
mod coordinator;
mod proxy;

pub use candidates::{CandidatePlan, build_candidates, is_private_ipv4, local_addresses};
pub use coordinator::{CandidateStep, OfferStep, SocksRelayCoordinator, StreamhostsStep, UsedStep};
pub use proxy::{ProxyDirectory, ProxyState};
