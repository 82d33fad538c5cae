use mio::Poll;
use packsaver::config::Options;
use packsaver::error::CleanError;
use packsaver::server::Server;
use proxy_log::{errors, info};

fn main() {
    if let Err(e) = run() {
        errors!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), CleanError> {
    let opts = Options::parse();
    opts.validate().map_err(|e| CleanError(packsaver::error::ProxyError::Parse(e.to_string())))?;

    mask_sigpipe();

    if opts.verbose > 0 {
        info!("verbosity level {}", opts.verbose);
    }

    let poll = Poll::new()?;
    let server = Server::new(&opts, &poll)?;
    server.run(poll)?;
    Ok(())
}

/// Masks SIGPIPE so a write to a peer that already closed its socket
/// surfaces as an `EPIPE` write error instead of terminating the process.
fn mask_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
