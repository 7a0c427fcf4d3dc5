use http;


error_chain! {
    foreign_links {
        Io(::std::io::Error);
        Http(http::Error);
    }
    errors {
        Bind(addr: String) {
            description("Failed to bind listening socket")
            display("failed to bind {}", addr)
        }
        MalformedHttpRequest(s: String) {
            description("Malformed HTTP Request")
            display("MalformedHttpRequest: {}", s)
        }
        RequestHeadersTooLarge(s: String) {
            description("Request Headers Too Large")
            display("RequestHeadersTooLarge: {}", s)
        }
        RequestBodyTooLarge(s: String) {
            description("Request Body Too Large")
            display("RequestBodyTooLarge: {}", s)
        }
    }
}
