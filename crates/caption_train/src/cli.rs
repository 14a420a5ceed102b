use crate::evaluate::EvalArgs;
use crate::train::TrainArgs;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Image caption training toolchain", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a caption model
    Train(TrainArgs),

    /// Evaluate a checkpoint on one split
    Eval(EvalArgs),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::parse_from(["caption_train", "train", "--id", "fc1", "--max-epochs", "2"]);
        match cli.command {
            Commands::Train(args) => {
                assert_eq!(args.id, "fc1");
                assert_eq!(args.max_epochs, 2);
            }
            Commands::Eval(_) => panic!("expected train"),
        }

        let cli = Cli::parse_from(["caption_train", "eval", "--split", "val", "--num-images", "-1"]);
        match cli.command {
            Commands::Eval(args) => {
                assert_eq!(args.split, "val");
                assert_eq!(args.num_images, -1);
            }
            Commands::Train(_) => panic!("expected eval"),
        }
    }
}
