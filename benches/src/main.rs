use bevy::app::App;

mod cli;
mod scenes;

/// A benchmark that can be run with the CLI.
#[derive(Clone, Copy, Debug)]
pub struct Benchmark {
    /// The name of the benchmark.
    pub name: &'static str,
    /// The name of the module where the benchmark is defined.
    pub module: &'static str,
    /// A function that constructs the benchmark application.
    pub constructor: fn() -> App,
}

impl Benchmark {
    /// Creates a new benchmark with the given name, module, and constructor function.
    pub const fn new(name: &'static str, module: &'static str, constructor: fn() -> App) -> Self {
        Self {
            name,
            module,
            constructor,
        }
    }
}

fn main() {
    let benchmarks = scenes::BENCHMARKS;
    let args = cli::Args::parse();

    if args.list {
        cli::list(benchmarks);
        return;
    }

    let selected: Vec<&Benchmark> = match &args.name {
        Some(name) => {
            let by_number = name
                .parse::<usize>()
                .ok()
                .and_then(|i| benchmarks.get(i.checked_sub(1)?));
            match benchmarks.iter().find(|b| b.name == name).or(by_number) {
                Some(benchmark) => vec![benchmark],
                None => {
                    eprintln!("Benchmark '{name}' not found. Use --list to see available benchmarks.");
                    return;
                }
            }
        }
        None => benchmarks.iter().collect(),
    };

    cli::run(&selected, &args);
}
