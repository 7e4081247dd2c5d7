use std::process::exit;

use vstated_lib::{args::parse_args, daemon::run};

pub fn main() {
    let args = parse_args();
    exit(run(args));
}
