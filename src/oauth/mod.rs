//! OAuth 2.1 discovery and registration surfaces.
//!
//! - [`resource`]: protected resource metadata (RFC 9728)
//! - [`discovery`]: authorization server metadata proxy (RFC 8414)
//! - [`registration`]: dynamic client registration (RFC 7591)
//! - [`index`]: the registration dedup index
//! - [`upstream`]: the identity provider's client-admin API

pub mod discovery;
pub mod index;
pub mod registration;
pub mod resource;
pub mod upstream;

pub use discovery::{
    AuthorizationServerMetadataProxy, HttpUpstreamMetadata, MetadataCache, MetadataError,
    UpstreamMetadata,
};
pub use index::{ClientIndex, ClientIndexEntry, FileClientIndex, InMemoryClientIndex, IndexError};
pub use registration::{DynamicClientRegistrar, RegistrationError, client_key};
pub use resource::{ConfigValidation, ResourceMetadataPublisher};
pub use upstream::{ClientAdmin, ClientAdminError, HttpClientAdmin, InMemoryClientAdmin};
