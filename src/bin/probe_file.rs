use podsync_lib::metadata::{LoftyProbe, MetadataProbe, TypeResolution};
use podsync_lib::models::MediaType;
use std::env;
use std::path::Path;
use std::process::ExitCode;

/// Prints what a sync would record for one file, as JSON.
fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        println!("Usage: probe_file <file_path> [media_type]");
        return ExitCode::FAILURE;
    }

    let path = Path::new(&args[1]);
    if !path.is_file() {
        println!("Not a file: {}", path.display());
        return ExitCode::FAILURE;
    }

    let resolution = match args.get(2).map(|t| t.parse::<MediaType>()) {
        None => TypeResolution::Probe,
        Some(Ok(media_type)) => TypeResolution::Forced(media_type),
        Some(Err(e)) => {
            println!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("Reading file: {}", path.display());
    let record = LoftyProbe.probe(path, resolution);

    match serde_json::to_string_pretty(&record) {
        Ok(json) => {
            println!("{}", json);
            if let Some(artwork) = &record.artwork {
                println!("Embedded artwork: {} bytes ({})", artwork.data.len(), artwork.format.as_str());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("Error serializing record: {}", e);
            ExitCode::FAILURE
        }
    }
}
