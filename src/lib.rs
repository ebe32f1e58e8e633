//! # Lodestar
//!
//! The request-execution core of an async client for a distributed
//! document database.
//!
//! Lodestar provides:
//! - An ordered binary document model with a streaming codec
//! - A type-keyed serializer registry that derives serializers from `serde`
//! - Read-preference server selection over a live topology snapshot
//! - Per-server connection pools with scoped channels
//! - A command protocol speaking both the extensible and the legacy frame
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lodestar::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), lodestar::DriverError> {
//!     let config = ClientConfig::builder()
//!         .host("localhost:27017".parse()?)
//!         .build()?;
//!     let client = Client::new(config)?;
//!
//!     let reply = client
//!         .run_command("admin", doc! { "buildInfo" => 1 })
//!         .await?;
//!     println!("{}", reply.document());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// Document model, codec and serializers.
pub mod bson {
    pub use lodestar_bson::*;
}

pub use lodestar_bson::{Bson, BsonError, Document, ObjectId, doc};
pub use lodestar_core::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use lodestar_bson::{Bson, Document, ObjectId, doc};
    pub use lodestar_core::prelude::*;
}
