use gltf_squash::prelude::{optimize, OptimizeConfig};
use std::fs::File;
use std::io::{BufReader, BufWriter};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input.glb> <output.glb> [config.toml]", args[0]);
        std::process::exit(1);
    }

    let input_path = &args[1];
    let output_path = &args[2];

    let config = match args.get(3) {
        Some(path) => OptimizeConfig::from_path(path).expect("Failed to read config"),
        None => OptimizeConfig::default(),
    };

    let file = File::open(input_path).expect("Failed to open input file");
    let mut reader = BufReader::new(file);

    let result = optimize(&mut reader, &config).expect("Failed to optimize");

    let output = File::create(output_path).expect("Failed to create output file");
    let mut writer = BufWriter::new(output);
    std::io::Write::write_all(&mut writer, &result).expect("Failed to write output");

    println!("Done! Output written to {}", output_path);
}
