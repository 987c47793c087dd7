use stats_dashboard::utils::display::DisplayFormatter;
use stats_dashboard::{DataLayer, RequestError};
use serde_json::Value;
use std::error::Error;
use std::io::{self, Write};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting statistics dashboard console");

    let layer = DataLayer::from_env();
    let display = DisplayFormatter::new();
    info!("Using backend at {}", layer.api.config().base_url);

    let _subscription = layer.filters.subscribe(|filters, _| {
        debug!("Filters changed: {:?}", filters);
        Ok(())
    });
    layer.load_filter_options().await;

    println!("=== Statistics Dashboard ===");
    println!("Commands:");
    println!("  overview              - Filtered overview statistics");
    println!("  stats                 - Basic statistics");
    println!("  charts                - Load all findings charts");
    println!("  options               - Show available filter values");
    println!("  filter <name> <value> - Set a filter (time_period, representation, case_type)");
    println!("  url <query>           - Apply filters from a query string");
    println!("  filters               - Show active filters");
    println!("  clear                 - Reset all filters");
    println!("  refresh               - Drop cached responses");
    println!("  status | reload | health");
    println!("  exit                  - Exit the program");

    let mut input = String::new();
    loop {
        input.clear();
        print!("> ");
        io::stdout().flush()?;
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }

        let mut words = input.split_whitespace();
        let command = words.next().unwrap_or_default();
        debug!("Received command: {}", command);

        match command {
            "" => continue,
            "exit" => break,
            "overview" => {
                print_json(&display, "Overview", layer.api.get_filtered_overview(None).await)
            }
            "stats" => print_json(
                &display,
                "Basic Statistics",
                layer.api.get_basic_statistics(None).await,
            ),
            "charts" => {
                let charts = layer.api.get_all_chart_data(None).await;
                println!("{}", display.format_header("Findings"));
                println!("{}", display.format_chart_summary(&charts));
            }
            "options" => {
                let options = layer.load_filter_options().await;
                println!("{}", display.format_header("Filter Options"));
                println!("{}", display.format_filter_options(&options));
            }
            "filter" => match (words.next(), words.next()) {
                (Some(name), Some(value)) => {
                    if !layer.filters.set_filter(name, value) {
                        println!("Nothing changed for '{}'", name);
                    }
                }
                _ => println!("Usage: filter <name> <value>"),
            },
            "url" => {
                layer.filters.from_query_params(words.next().unwrap_or_default());
                println!("Query: ?{}", layer.filters.to_query_params());
            }
            "filters" => {
                println!("{}", display.format_header("Active Filters"));
                println!(
                    "{}",
                    display.format_active_filters(&layer.filters.get_active_filters_summary())
                );
            }
            "clear" => layer.filters.clear_filters(),
            "refresh" => layer.api.clear_cache(),
            "status" => print_json(&display, "Data Status", layer.api.get_data_status().await),
            "reload" => print_json(&display, "Reload", layer.api.force_reload_data().await),
            "health" => {
                let healthy = layer.api.health_check().await.is_ok();
                println!("Backend health: {}", display.format_status(healthy));
            }
            other => println!("Unknown command: {}", other),
        }
    }

    info!("Shutting down");
    Ok(())
}

fn print_json(display: &DisplayFormatter, title: &str, result: Result<Value, RequestError>) {
    println!("{}", display.format_header(title));
    match result {
        Ok(data) => println!("{}", display.format_json(&data)),
        Err(e) => println!("{} {}", display.format_status(false), e),
    }
}
