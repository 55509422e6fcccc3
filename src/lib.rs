//! A per-process file-system redirection engine.
//!
//! The engine answers one question on every intercepted file syscall: does
//! this path resolve somewhere else? Overlay folders (mod folders) are
//! layered over a base folder (the game folder); reads and enumerations
//! see the merged view while nothing on disk changes.
//!
//! # Structure
//!
//! Configuration calls feed the [`manager::RedirectionManager`], which
//! maintains a mutable [`tree::RedirectionTree`] while redirects are being
//! registered. [`manager::RedirectionManager::optimise`] compiles it into
//! the immutable [`tree::lookup::LookupTree`] consulted on the hot path:
//! one prefix compare and two map lookups, with nothing allocated. The
//! [`enumeration`] module splices overlay entries into directory listings
//! per open handle, and [`handles`] carries the per-handle state plus the
//! primitives the hooks need (recursion guards, the closed-handle queue).
//!
//! Everything works on uppercase paths with `\` separators; see [`path`]
//! for the folding rules. The syscall hooking itself lives in the host --
//! this crate only exposes the structures the hooks consult.

pub mod config;
pub mod enumeration;
pub mod handles;
pub mod manager;
pub mod path;
pub mod pool;
pub mod redirection;
pub mod scanner;
pub mod strmap;
pub mod tree;

pub use handles::{HandleState, HandleTable, RecursionGuards};
pub use manager::RedirectionManager;
pub use redirection::{FileRedirection, FolderRedirection, Target};
pub use strmap::StrMap;
pub use tree::lookup::LookupTree;
pub use tree::RedirectionTree;
