use clap::Parser;
use steady_scheduler::LogLevel;

#[derive(Parser, Debug, PartialEq, Clone)]
#[command(about = "Spreads synthetic busy actors across runner threads")]
pub struct Args {
    #[arg(short = 't', long = "threads", default_value = "2", value_parser = validate_threads)]
    pub threads: usize,

    #[arg(short = 'a', long = "actors", default_value = "8")]
    pub actors: usize,

    #[arg(short = 'r', long = "run_seconds", default_value = "10", value_parser = run_duration_validator)]
    pub run_seconds: u64,

    #[arg(short = 'i', long = "imbalance", default_value = "0.25", value_parser = validate_imbalance)]
    pub imbalance: f64,

    #[arg(short = 'l', long = "loglevel", default_value = "info", value_parser = validate_logging_level)]
    pub loglevel: String,
}

fn validate_threads(val: &str) -> Result<usize, String> {
    match val.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(String::from("threads must be a positive number.")),
    }
}

fn run_duration_validator(val: &str) -> Result<u64, String> {
    match val.parse::<u64>() {
        Ok(i) if i <= 120 => Ok(i),
        _ => Err(String::from("run must be 120 or less.")),
    }
}

fn validate_imbalance(val: &str) -> Result<f64, String> {
    match val.parse::<f64>() {
        Ok(f) if (0.0..=1.0).contains(&f) => Ok(f),
        _ => Err(String::from("imbalance must be between 0.0 and 1.0.")),
    }
}

fn validate_logging_level(level: &str) -> Result<String, String> {
    level
        .parse::<LogLevel>()
        .map(|_| level.to_lowercase())
        .map_err(|_| String::from("Invalid logging level format."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = Args::parse_from([""]);
        assert_eq!(args.threads, 2);
        assert_eq!(args.actors, 8);
        assert_eq!(args.run_seconds, 10);
        assert_eq!(args.imbalance, 0.25);
        assert_eq!(args.loglevel, "info");
    }

    #[test]
    fn test_custom_values() {
        let args = Args::parse_from(["", "-t", "4", "-a", "16", "-r", "30", "-i", "0.1", "-l", "DEBUG"]);
        assert_eq!(args.threads, 4);
        assert_eq!(args.actors, 16);
        assert_eq!(args.run_seconds, 30);
        assert_eq!(args.imbalance, 0.1);
        assert_eq!(args.loglevel, "debug");
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        assert!(Args::try_parse_from(["", "-t", "0"]).is_err());
        assert!(Args::try_parse_from(["", "-r", "121"]).is_err());
        assert!(Args::try_parse_from(["", "-i", "1.5"]).is_err());
    }

    #[test]
    fn test_logging_level_variants() {
        for &level in LogLevel::variants() {
            assert!(validate_logging_level(level).is_ok());
        }
        let result = validate_logging_level("invalid_level");
        assert_eq!(result, Err(String::from("Invalid logging level format.")));
    }
}
