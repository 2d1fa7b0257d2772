use clap::{value_parser, Arg, Command, ValueHint};
use lumen_cli::input::Input;
use lumen_cli::runner::Runner;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Error)
        .parse_env(env_logger::Env::default().filter_or("LUMEN_LOG", "error,lumen=info"))
        .init();

    let matches = Command::new("lumen")
        .version(clap::crate_version!())
        .about("Label-free MS1 quantification with match-between-runs")
        .arg(
            Arg::new("parameters")
                .required(true)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Path to configuration parameters (JSON file)")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("identifications")
                .short('i')
                .long("identifications")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path to a tab-separated identification table. Overrides the \
                     table specified in the configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("output_directory")
                .short('o')
                .long("output_directory")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path where quantification results will be written. \
                     Overrides the directory specified in the configuration file.",
                )
                .value_hint(ValueHint::DirPath),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .value_parser(value_parser!(u16).range(1..))
                .help("Number of worker threads (default = # of CPUs - 1)")
                .value_hint(ValueHint::Other),
        )
        .arg(
            Arg::new("mbr")
                .long("mbr")
                .action(clap::ArgAction::SetTrue)
                .help("Enable match-between-runs"),
        )
        .help_template(
            "{usage-heading} {usage}\n\n\
             {about-with-newline}\n\
             Version {version}\n\n\
             {all-args}{after-help}",
        )
        .get_matches();

    let input = Input::from_arguments(matches)?;

    input.build().and_then(Runner::new)?.run()?;

    Ok(())
}
