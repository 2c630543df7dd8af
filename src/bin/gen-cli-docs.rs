use clap_markdown::help_markdown;
use sector_rr::cli::Cli;

fn main() {
    println!("# sector-rr CLI Reference");
    println!();
    println!("This page contains the auto-generated reference documentation for the `sector-rr` command-line interface.");
    println!();

    println!("{}", help_markdown::<Cli>());
}
