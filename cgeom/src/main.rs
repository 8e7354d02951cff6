use cgeom_lib::ply::{parse_mesh, write_mesh};
use cgeom_lib::{
    compress_mesh, decompress_mesh, CompressedGeometryFile, CompressionOptions, GeometryDecompressor,
};
use clap::{Parser, Subcommand};
use std::error::Error;
use std::fs;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "Compressed Geometry Tool",
    version = "1.0",
    author = "Denis Avvakumov",
    about = "Compresses PLY meshes into compressed geometry files and back"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compress a PLY mesh into a compressed geometry file.
    Compress {
        #[arg(short = 'i', long = "input", value_name = "INPUT", help = "Path to the input PLY file.")]
        input: String,

        #[arg(short = 'o', long = "output", value_name = "OUTPUT", help = "Path to the output file.")]
        output: String,

        #[arg(
            short = 'a',
            long = "append",
            default_value = "false",
            help = "Append to an existing file instead of replacing its objects."
        )]
        append: bool,

        #[arg(long = "position-bits", value_name = "BITS", default_value = "16", help = "Position precision (1..=16).")]
        position_bits: u32,

        #[arg(long = "color-bits", value_name = "BITS", default_value = "9", help = "Color precision (2..=16).")]
        color_bits: u32,

        #[arg(long = "normal-bits", value_name = "BITS", default_value = "6", help = "Normal precision (0..=6).")]
        normal_bits: u32,
    },
    /// Print the objects stored in a compressed geometry file.
    Info {
        #[arg(short = 'i', long = "input", value_name = "INPUT", help = "Path to the compressed geometry file.")]
        input: String,
    },
    /// Expand one object into a PLY mesh in normalized coordinates.
    Decompress {
        #[arg(short = 'i', long = "input", value_name = "INPUT", help = "Path to the compressed geometry file.")]
        input: String,

        #[arg(short = 'o', long = "output", value_name = "OUTPUT", help = "Path to the output PLY file.")]
        output: String,

        #[arg(long = "index", value_name = "INDEX", default_value = "0", help = "Object to expand.")]
        index: usize,
    },
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let start = Instant::now();

    match cli.command {
        Command::Compress {
            input,
            output,
            append,
            position_bits,
            color_bits,
            normal_bits,
        } => {
            let raw_data = fs::read(&input)?;
            let mesh = parse_mesh(&raw_data)?;
            info!(
                input = %input,
                vertices = mesh.vertex_count(),
                faces = mesh.faces.len(),
                "loaded mesh"
            );

            let options = CompressionOptions {
                position_bits,
                color_bits,
                normal_bits,
                ..CompressionOptions::default()
            };
            let geometry = compress_mesh(&mesh, options)?;

            let mut file = CompressedGeometryFile::open(&output, true)?;
            if !append && file.object_count() > 0 {
                warn!(output = %output, objects = file.object_count(), "replacing existing objects");
                file.clear()?;
            }
            file.write(&geometry)?;
            let objects = file.object_count();
            file.close()?;

            info!(
                output = %output,
                bytes = geometry.data.len(),
                objects,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "compression finished"
            );
        }
        Command::Info { input } => {
            let mut file = CompressedGeometryFile::open(&input, false)?;
            println!(
                "{}: version {}, {} object(s)",
                input,
                file.version(),
                file.object_count()
            );
            for index in 0..file.object_count() {
                let geometry = file.read(index)?;
                let decoded = GeometryDecompressor::decompress(&geometry)?;
                let header = &geometry.header;
                println!(
                    "  [{}] {:?} | {} bytes | {} vertices | normals: {} | colors: {}{}",
                    index,
                    header.buffer_type,
                    header.size,
                    decoded.vertices.len(),
                    header.normals,
                    header.colors,
                    if header.alpha { " (alpha)" } else { "" }
                );
            }
            file.close()?;
        }
        Command::Decompress {
            input,
            output,
            index,
        } => {
            let mut file = CompressedGeometryFile::open(&input, false)?;
            let geometry = file.read(index)?;
            file.close()?;

            let mesh = decompress_mesh(&geometry)?;
            let mut buffer = Vec::new();
            write_mesh(&mesh, &mut buffer)?;
            fs::write(&output, &buffer)?;

            info!(
                output = %output,
                vertices = mesh.vertex_count(),
                faces = mesh.faces.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "decompression finished"
            );
        }
    }

    Ok(())
}
