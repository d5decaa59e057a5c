#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io::Write;

use log::debug;
use tokio::runtime::Builder;

use aegir::config;
use aegir::tcp_server::start_servers;

fn print_usage_and_exit(arg0: String) {
    eprintln!("Usage: {arg0} [--threads/-t N] [--dry-run/-d] <config filename> [config filename] [..]");
    std::process::exit(1);
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            let level_style = buf.default_level_style(record.level());
            let sanitized_args = format!("{}", record.args())
                .chars()
                .map(|c| {
                    if c.is_ascii_graphic() || c == ' ' {
                        c
                    } else {
                        '?'
                    }
                })
                .collect::<String>();

            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}] {}",
                timestamp,
                record.level(),
                record.target(),
                sanitized_args
            )
        })
        .init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut num_threads = 0usize;
    let mut dry_run = false;

    while !args.is_empty() && args[0].starts_with("-") {
        if args[0] == "--threads" || args[0] == "-t" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing threads argument.");
                print_usage_and_exit(arg0);
                return;
            }
            num_threads = match args.remove(0).parse::<usize>() {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("Invalid thread count: {e}");
                    print_usage_and_exit(arg0);
                    return;
                }
            };
        } else if args[0] == "--dry-run" || args[0] == "-d" {
            args.remove(0);
            dry_run = true;
        } else {
            eprintln!("Invalid argument: {}", args[0]);
            print_usage_and_exit(arg0);
            return;
        }
    }

    if args.is_empty() {
        eprintln!("No config specified.");
        print_usage_and_exit(arg0);
        return;
    }

    let mut builder = if num_threads == 1 {
        Builder::new_current_thread()
    } else {
        let mut mt = Builder::new_multi_thread();
        if num_threads > 0 {
            println!("Using custom thread count ({num_threads})");
            mt.worker_threads(num_threads);
        }
        mt
    };

    let runtime = match builder.enable_io().enable_time().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not build tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.block_on(async move {
        let entries = match config::load_configs(&args).await {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load server configs: {e}\n");
                print_usage_and_exit(arg0);
                return;
            }
        };

        let server_configs = match config::create_server_configs(entries) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to create server configs: {e}\n");
                print_usage_and_exit(arg0);
                return;
            }
        };

        for server_config in server_configs.iter() {
            debug!("================================================================================");
            debug!("{server_config:#?}");
        }

        if dry_run {
            for server_config in server_configs.iter() {
                println!("{server_config:#?}");
            }
            println!("Finishing dry run, config parsed successfully.");
            return;
        }

        println!("\nStarting {} server(s)..", server_configs.len());

        let join_handles = match start_servers(server_configs).await {
            Ok(handles) => handles,
            Err(e) => {
                eprintln!("Failed to start servers: {e}");
                std::process::exit(1);
            }
        };

        // The accept loops never return on their own.
        futures::future::join_all(join_handles).await;
    });
}
