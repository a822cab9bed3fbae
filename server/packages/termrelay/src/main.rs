fn main() {
    if let Err(err) = termrelay::cli::run_termrelay() {
        tracing::error!(error = %err, "termrelay failed");
        std::process::exit(1);
    }
}
