//! Name resolution for the default transport.
//!
//! The pool never resolves names itself; resolution belongs to the transport
//! layer, behind the [`Resolve`] trait:
//! - [`resolve`]: the `Resolve` trait, `Name`, and an overrides wrapper
//! - [`gai`]: system resolver via `getaddrinfo` plus an IP-literal fast path
//! - [`hickory`]: fully-async resolver backed by hickory-dns

pub mod gai;
pub mod hickory;
pub mod resolve;

pub use gai::{GaiResolver, HostAddrs};
pub use hickory::HickoryResolver;
pub use resolve::{Addrs, Name, Resolve, ResolverWithOverrides, Resolving};
