extern crate ok_responder;
extern crate env_logger;

use std::env;
use std::io::Write;
use std::process;


fn init_logger() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(buf, "[{}] - [{}] -> {}",
                record.level(),
                record.module_path().unwrap_or("?"),
                record.args()
                )
            })
        .parse(&env::var("LOG").unwrap_or_default())
        .try_init()?;
    Ok(())
}


/// An optional argument picks the listen address: a bare port binds every
/// interface, anything else is taken as `host:port`.
fn run() -> ok_responder::Result<()> {
    match env::args().nth(1) {
        None => ok_responder::start_server(ok_responder::DEFAULT_PORT),
        Some(arg) => match arg.parse::<u16>() {
            Ok(port) => ok_responder::start_server(port),
            Err(_) => ok_responder::start(arg.as_str(), ok_responder::respond),
        },
    }
}


pub fn main() {
    if let Err(e) = init_logger() {
        eprintln!("Error: failed to initialize logger: {}", e);
    }
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        for cause in e.iter().skip(1) {
            eprintln!("Caused by: {}", cause);
        }
        process::exit(1);
    }
}
