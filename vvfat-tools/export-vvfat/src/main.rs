use clap::{App, Arg};
use std::io::SeekFrom;
use std::path::Path;
use std::process::exit;
use vvfat::{BlockDevice, VvfatConfig, VvfatImage};
use vvfat_tool_lib::{sized_string_to_u64, u64_to_sized_string, RawImage};

fn main() {
    let arguments = App::new("export-vvfat")
        .version("0.1.0")
        .about("This program flattens a directory into a raw FAT disk image.")
        .arg(
            Arg::with_name("directory")
                .required(true)
                .takes_value(true)
                .help("The directory to shadow"),
        )
        .arg(
            Arg::with_name("output")
                .required(true)
                .takes_value(true)
                .help("The path of the raw image to write"),
        )
        .arg(
            Arg::with_name("size")
                .short("s")
                .required(false)
                .takes_value(true)
                .help("The virtual disk size, e.g. 1440KiB for a floppy"),
        )
        .get_matches();

    let directory = match arguments.value_of("directory") {
        Some(d) => d,
        None => {
            eprintln!("A directory is required.");
            exit(1);
        }
    };

    let output = match arguments.value_of("output") {
        Some(o) => o,
        None => {
            eprintln!("An output path is required.");
            exit(1);
        }
    };

    let disk_size = match arguments.value_of("size") {
        Some(s) => match sized_string_to_u64(s) {
            Some(n) => n,
            None => {
                eprintln!("Could not parse size '{}'.", s);
                exit(1);
            }
        },
        None => 0,
    };

    let config = VvfatConfig {
        disk_size,
        ..VvfatConfig::default()
    };

    let mut image = match VvfatImage::open(Path::new(directory), config) {
        Ok(i) => i,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };

    let total_bytes = (image.sector_count() as u64) * 512;
    let mut raw = match RawImage::new_create(output, total_bytes) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };

    if let Err(e) = image.seek(SeekFrom::Start(0)) {
        eprintln!("Error: {}", e);
        exit(1);
    }
    if let Err(e) = raw.seek(SeekFrom::Start(0)) {
        eprintln!("Error: {}", e);
        exit(1);
    }

    // stream the synthesized volume across in 32 KiB slices
    let mut buffer = vec![0u8; 64 * 512];
    let mut remaining = total_bytes;
    while remaining > 0 {
        let n = remaining.min(buffer.len() as u64) as usize;
        if let Err(e) = image.read(&mut buffer[..n]) {
            eprintln!("Error while reading the virtual volume: {}", e);
            exit(1);
        }
        if let Err(e) = raw.write(&buffer[..n]) {
            eprintln!("Error while writing the image: {}", e);
            exit(1);
        }
        remaining -= n as u64;
    }

    let geometry = image.geometry();
    println!(
        "Exported '{}' to '{}' ({}, {}/{}/{})",
        directory,
        output,
        u64_to_sized_string(total_bytes),
        geometry.cylinders,
        geometry.heads,
        geometry.spt
    );

    image.close();
}
