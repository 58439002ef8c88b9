use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use mnist_export::export::{DEFAULT_IMAGES_OUTPUT, DEFAULT_INPUT, DEFAULT_LABELS_OUTPUT};
use mnist_export::SubsetSelection;

#[derive(Parser, Debug)]
#[command(
    name = "mnist-export",
    about = "Export the MNIST pickle archive as plain-text label and pixel files."
)]
pub struct Cli {
    /// Gzip-compressed pickle archive to read
    #[arg(short, long, env = "MNIST_EXPORT_INPUT", default_value = DEFAULT_INPUT, global = true)]
    pub input: PathBuf,

    /// Also write the run summary as JSON to this path
    #[arg(long, global = true)]
    pub summary_json: Option<PathBuf>,

    /// Exit with status 0 even when the export fails
    #[arg(long, global = true)]
    pub exit_zero: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Every label of every subset, one per line
    Labels {
        #[arg(short, long, default_value = DEFAULT_LABELS_OUTPUT)]
        output: PathBuf,
    },
    /// One comma-separated pixel row per image
    Images {
        #[arg(short, long, default_value = DEFAULT_IMAGES_OUTPUT)]
        output: PathBuf,

        /// Which subset's images to write
        #[arg(long, value_enum, default_value_t = SubsetArg::Training)]
        subset: SubsetArg,
    },
    /// A label line followed by its pixel row, for each training image
    Pairs {
        #[arg(short, long, default_value = DEFAULT_IMAGES_OUTPUT)]
        output: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum SubsetArg {
    Training,
    Validation,
    Test,
    All,
}

impl SubsetArg {
    pub fn into_selection(self) -> SubsetSelection {
        match self {
            SubsetArg::Training => SubsetSelection::Training,
            SubsetArg::Validation => SubsetSelection::Validation,
            SubsetArg::Test => SubsetSelection::Test,
            SubsetArg::All => SubsetSelection::All,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_legacy_paths() {
        let cli = Cli::try_parse_from(["mnist-export", "labels"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Labels {
                output: PathBuf::from("mnist_labels.txt")
            }
        );
        assert!(!cli.exit_zero);
        assert!(cli.summary_json.is_none());
    }

    #[test]
    fn images_subset_and_global_flags() {
        let cli = Cli::try_parse_from([
            "mnist-export",
            "images",
            "--subset",
            "all",
            "--input",
            "data.pkl.gz",
            "--exit-zero",
        ])
        .unwrap();
        assert_eq!(cli.input, PathBuf::from("data.pkl.gz"));
        assert!(cli.exit_zero);
        let Command::Images { output, subset } = cli.command else {
            panic!("expected images command");
        };
        assert_eq!(output, PathBuf::from("mnist_output.txt"));
        assert_eq!(subset.into_selection(), SubsetSelection::All);
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["mnist-export"]).is_err());
    }
}
