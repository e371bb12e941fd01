//! # kiln-gen
//!
//! Streaming code generation for kiln.
//!
//! Sends a prompt to a chat-completion backend, decodes the event stream
//! into text deltas, and carves a [`GeneratedArtifact`] out of the model's
//! free-form output as it grows.
//!
//! ## Quick Start
//!
//! ```no_run
//! use futures::StreamExt;
//! use kiln_gen::{GenerationClient, GenerationConfig, GenerationEvent, GenerationRequest};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> kiln_gen::Result<()> {
//! let config = GenerationConfig::builder().api_key("sk-...").build()?;
//! let client = GenerationClient::new(config)?;
//!
//! let stream = client.generate(
//!     GenerationRequest::new("a counter button"),
//!     CancellationToken::new(),
//! );
//! futures::pin_mut!(stream);
//! while let Some(event) = stream.next().await {
//!     match event? {
//!         GenerationEvent::Partial(artifact) => println!("{} bytes so far", artifact.code.len()),
//!         GenerationEvent::Complete(done) => println!("{}", done.artifact.explanation),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod artifact;
mod client;
mod decoder;
mod error;
mod extract;

pub use artifact::GeneratedArtifact;
pub use client::{
    Completion, GenerationClient, GenerationConfig, GenerationConfigBuilder, GenerationEvent,
    GenerationRequest, StreamingParseState, DEFAULT_ENDPOINT, DEFAULT_MODEL, SYSTEM_PROMPT,
};
pub use decoder::{StreamDecoder, StreamEvent, Utf8StreamDecoder};
pub use error::{GenerationError, Result};
pub use extract::{extract, fallback_artifact, try_extract, ExtractError, DEFAULT_EXPLANATION};
