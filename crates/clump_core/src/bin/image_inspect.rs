//! # Image Inspector
//!
//! Command-line tool to inspect load-in-place images without loading them.

use clump_core::image::format::{table_offset, HEADER_SIZE, POINTER_SIZE};
use clump_core::{read_image_info, ClumpConfig};
use std::fs::File;
use std::io::BufReader;

fn main() {
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║         CLUMP IMAGE INSPECTOR                                    ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        println!("Usage: image_inspect <image.lip>");
        println!();
        println!("Options:");
        println!("  --verbose          List every block and fixup");
        println!("  --config <file>    Check identity against a TOML configuration");
        return;
    }

    let image_path = &args[1];
    let verbose = args.iter().any(|a| a == "--verbose");
    let config = match args.iter().position(|a| a == "--config").and_then(|i| args.get(i + 1)) {
        Some(path) => match ClumpConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                println!("Error: {e}");
                return;
            }
        },
        None => ClumpConfig::default(),
    };

    println!("Reading image: {image_path}");

    let file = match File::open(image_path) {
        Ok(f) => f,
        Err(e) => {
            println!("Error: Could not open file: {e}");
            return;
        }
    };

    let mut reader = BufReader::new(file);
    let info = match read_image_info(&mut reader) {
        Ok(i) => i,
        Err(e) => {
            println!("Error: Could not read image: {e}");
            return;
        }
    };

    let header = &info.header;
    let payload = u64::from(header.payload_size);
    println!();
    println!("┌─ IMAGE HEADER ─────────────────────────────────────────────────┐");
    println!("│ File Type:          {}", header.filetype());
    println!("│ Class:              {}", header.class());
    println!("│ Session:            {:#010x}", header.session_id);
    println!("│ Payload:            {payload} bytes");
    println!("│ Fixup Table At:     {}", table_offset(payload));
    println!("│ Image Size:         {} bytes", info.image_size);
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    let identity = clump_core::registry_builder()
        .and_then(|builder| Ok(builder.build()?))
        .and_then(|registry| info.verify_identity(&config.image, &registry));
    let identity_ok = identity.is_ok();
    match identity {
        Ok(()) => println!(
            "Identity matches {} / {} / session {:#010x}.",
            config.image.filetype_tag,
            header.class(),
            config.image.session_id
        ),
        Err(e) => println!("Identity MISMATCH: {e}"),
    }

    let block_count = info.block_offsets.len();
    let bad_fixups = info
        .fixups
        .iter()
        .filter(|f| {
            f.target_block_index as usize >= block_count || u64::from(f.write_offset) + POINTER_SIZE > payload
        })
        .count();

    println!();
    println!("┌─ TABLES ───────────────────────────────────────────────────────┐");
    println!("│ Blocks:             {block_count}");
    println!("│ Fixups:             {}", info.fixups.len());
    println!("│ Out-of-range:       {bad_fixups}");
    println!("└──────────────────────────────────────────────────────────────────┘");

    if verbose {
        println!();
        println!("Blocks (file offset / payload offset / span):");
        for (i, &offset) in info.block_offsets.iter().enumerate() {
            let end = info.block_offsets.get(i + 1).map_or(payload, |&next| u64::from(next));
            println!(
                "  #{i:<5} {:>8} {:>8} {:>8}",
                HEADER_SIZE + u64::from(offset),
                offset,
                end.saturating_sub(u64::from(offset))
            );
        }
        println!();
        println!("Fixups (slot -> block):");
        for (i, f) in info.fixups.iter().enumerate() {
            println!("  #{i:<5} {:>8} -> #{}", f.write_offset, f.target_block_index);
        }
    }

    println!();
    if bad_fixups == 0 && identity_ok {
        println!("Image looks loadable.");
    } else {
        println!("Image will be rejected by the loader.");
    }
}
