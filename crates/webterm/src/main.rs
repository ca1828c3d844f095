use clap::Parser;

use webterm::Cli;
use webterm::init_tracing;
use webterm_common::ErrorCategory;

fn main() {
    let cli = Cli::parse();
    let _telemetry = init_tracing(&cli.server_config());

    if let Err(e) = webterm::run(&cli) {
        tracing::error!(code = e.code(), context = %e.context(), "webterm failed");
        eprintln!("Error: {}", e);
        eprintln!("Suggestion: {}", e.suggestion());
        if e.is_retryable() {
            eprintln!("(This error may be transient - retry may succeed)");
        }
        std::process::exit(exit_code_for(e.category()));
    }
}

fn exit_code_for(category: ErrorCategory) -> i32 {
    match category {
        ErrorCategory::InvalidInput => 64, // EX_USAGE
        ErrorCategory::NotFound => 69,     // EX_UNAVAILABLE
        ErrorCategory::Busy => 73,         // EX_CANTCREAT
        ErrorCategory::Conflict => 75,     // EX_TEMPFAIL
        ErrorCategory::Internal | ErrorCategory::External => 74, // EX_IOERR
    }
}
