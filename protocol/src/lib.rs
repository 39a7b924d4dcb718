//! Wire protocol for the sandkern control plane.
//!
//! Every supervisor-to-sentry call travels over a Unix-domain socket as a
//! length-prefixed JSON frame plus an ordered list of donated file
//! descriptors. Method names live in a dotted namespace
//! (`containerManager.Wait`, `Lifecycle.Pause`, ...). The same framing is
//! used in both directions; a request carries `{method, argument}` and a
//! response carries either `{result}` or `{error}`.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("sandkern only works on linux or android");

#[macro_use]
extern crate serde;

pub mod buffer;
pub mod client;
pub mod gofer;
pub mod methods;
pub mod server;

mod messages;
mod types;

pub use messages::*;
pub use types::*;
