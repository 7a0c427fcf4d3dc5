//! The constant responder: `200 OK`, body `ok`, for anything at all.

use {Request, Response};
use errors::*;
use server::Server;


/// Port the responder listens on unless told otherwise
pub const DEFAULT_PORT: u16 = 4500;

/// The whole response body
pub const BODY: &[u8] = b"ok";


/// Answer a request. Method, target, headers and body are all ignored.
pub fn respond(_request: Request) -> Response {
    Response::new(BODY.to_vec())
}

/// Listen on every interface at `port` and `respond` to each request.
///
/// Blocks for the life of the process once bound. Binding failures come
/// back as `ErrorKind::Bind`; it's up to the caller to report them and exit.
pub fn start_server(port: u16) -> Result<()> {
    Server::bind(("0.0.0.0", port))?.serve(respond)
}


#[cfg(test)]
mod tests {
    use super::*;
    use http::{self, StatusCode};

    #[test]
    fn ignores_everything_about_the_request() {
        let requests = vec![
            http::Request::builder().uri("/").body(Vec::new()).unwrap(),
            http::Request::builder().method("POST").uri("/submit")
                .header("content-type", "application/json")
                .body(b"{\"a\":1}".to_vec()).unwrap(),
            http::Request::builder().method("PURGE").uri("/a/b/c?x=1").body(b"junk".to_vec()).unwrap(),
        ];
        for request in requests {
            let response = respond(request);
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.body(), b"ok");
            assert!(response.headers().is_empty());
        }
    }
}
