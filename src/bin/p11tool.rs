extern crate p11engine;

use p11engine::cli::Options;

fn main() {
    if let Err(e) = Options::from_args().run() {
        eprintln!("{}", e);
        ::std::process::exit(1);
    }
}
