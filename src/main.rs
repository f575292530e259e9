fn main() {
    use std::error::Error;
    let registry = storyleech::Registry::with_defaults();
    let invocation = storyleech::cli::parse(&registry);
    if let Err(e) = storyleech::logging::init(invocation.cli.verbose) {
        eprintln!("Warning: {:#}", e);
    }
    if let Err(e) = storyleech::cli::run(&invocation, &registry) {
        eprintln!("{}", e);
        if invocation.cli.verbose {
            let mut source = e.source();
            while let Some(s) = source {
                eprintln!("  cause: {}", s);
                source = s.source();
            }
        }
        std::process::exit(e.exit_code());
    }
}
