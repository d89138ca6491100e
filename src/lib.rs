//! Multi-tenant LLM gateway (spec.md §1): decodes chat-completion requests
//! in several client wire formats ("frontdoors"), canonicalizes them, routes
//! them by model name and tenant policy to one of several upstream
//! model-provider APIs ("backends"), and re-encodes the response back into
//! the client's own format — unary or streamed.

pub mod auth;
pub mod backends;
pub mod canonical;
pub mod codecs;
pub mod config;
pub mod error;
pub mod frontdoors;
pub mod logging;
pub mod registry;
pub mod router;
pub mod server;
pub mod store;
pub mod tenant;
