//! Process entry point (SPEC_FULL §6): two positional arguments consumed
//! by the configuration parser, exit codes `0`/`1`/`2`.

use log::error;

use relayd::accept_loop;
use relayd::lifecycle::{self, ConfigureOutcome};

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let arg1 = args.first().map(String::as_str);
    let arg2 = args.get(1).map(String::as_str);

    let mut supervisor = match lifecycle::main_init() {
        Ok(supervisor) => supervisor,
        Err(e) => {
            eprintln!("relayd: failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    match lifecycle::main_configure(&mut supervisor, arg1, arg2) {
        Ok(ConfigureOutcome::Printed) => std::process::exit(2),
        Ok(ConfigureOutcome::Accepted) => {}
        Err(e) => {
            eprintln!("relayd: configuration failed: {}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = accept_loop::run(&mut supervisor) {
        error!("Accept loop exited with an error: {}", e);
        lifecycle::main_cleanup(&mut supervisor);
        std::process::exit(1);
    }

    lifecycle::main_cleanup(&mut supervisor);
    std::process::exit(0);
}
