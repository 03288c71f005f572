#![forbid(unsafe_code)]

fn main() {
    std::process::exit(client_sync_cli::run());
}
