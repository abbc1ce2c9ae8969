use std::process;

fn main() {
    if let Err(e) = carton::cli::run() {
        eprintln!("carton: {:#}", e);
        process::exit(1);
    }
}
