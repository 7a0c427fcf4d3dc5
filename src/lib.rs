//! A constant-response HTTP/1.1 server on top of mio.
//!
//! Every request, whatever its method, target, headers or body, is answered with
//! `200 OK` and the body `ok`. It exists to be hammered by load generators.
//!
//! ```no_run
//! extern crate ok_responder;
//!
//! fn main() {
//!     if let Err(e) = ok_responder::start_server(ok_responder::DEFAULT_PORT) {
//!         eprintln!("Error: {}", e);
//!     }
//! }
//! ```
#![recursion_limit="1024"]
#[macro_use] extern crate error_chain;
extern crate mio;
extern crate slab;
extern crate httparse;
extern crate http;
extern crate threadpool;
extern crate num_cpus;
#[macro_use] extern crate log;


/// Return early with an `ErrorKind` built from a format string
macro_rules! bail_fmt {
    ($kind:path, $fmt:expr) => {
        return Err($kind(format!($fmt)).into())
    };
    ($kind:path, $fmt:expr, $($arg:tt)+) => {
        return Err($kind(format!($fmt, $($arg)+)).into())
    };
}

mod errors;
mod http_stream;
mod response;
mod server;
mod responder;

pub use errors::*;
pub use server::{Server, start};
pub use responder::{respond, start_server, DEFAULT_PORT, BODY};


/// A fully read request, body included
pub type Request = http::Request<Vec<u8>>;

/// What a handler hands back to the server
pub type Response = http::Response<Vec<u8>>;

/// Request line and headers, parsed before the body has arrived
pub(crate) type RequestHead = http::Request<()>;
