// CLI: run a bytecode-JSON module.

use clap::Parser;

#[derive(Parser)]
#[command(name = "lunara", about = "Run a Lua 5.1 bytecode-JSON module", version)]
struct Args {
    /// Path to the module JSON emitted by the bytecode front-end.
    module: std::path::PathBuf,

    /// Log filter (e.g. "lunara=debug").
    #[arg(long)]
    log: Option<String>,
}

fn main() {
    let args = Args::parse();

    let filter = args.log.unwrap_or_else(|| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let source = match std::fs::read_to_string(&args.module) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("lunara: cannot read {}: {}", args.module.display(), e);
            std::process::exit(1);
        }
    };

    let mut vm = lunara::Vm::new();
    let module = match lunara::load_module(&mut vm, &source) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("lunara: {}", e);
            std::process::exit(1);
        }
    };

    match lunara::call_function(&mut vm, module.entry_function, &[]) {
        Ok(_) => {}
        Err(_) => {
            eprintln!("Uncaught error: {}", vm.error_message());
            std::process::exit(1);
        }
    }
}
