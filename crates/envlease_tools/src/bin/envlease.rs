#![forbid(unsafe_code)]

use std::env;

use envlease_tools::lease_cli::{execute_lease_command, lease_agent, parse_lease_args};

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    }
}

fn run() -> Result<i32, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let parsed = parse_lease_args(&args, env::var("ENVLEASE_URL").ok())?;
    let output = execute_lease_command(&lease_agent(), &parsed)?;
    println!("{}", output.body);
    Ok(output.exit_code())
}
