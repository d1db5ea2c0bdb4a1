use gc_spaces::utils::formatted_size;
use gc_spaces::*;
use std::process;
use std::str::FromStr;

fn main() {
    let level = std::env::var("GC_SPACES_LOG")
        .ok()
        .and_then(|level| log::Level::from_str(&level).ok())
        .unwrap_or(log::Level::Info);
    init_logging(level);

    let path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: gc-spaces <image>");
            process::exit(2);
        }
    };

    let lock = mutator_lock().shared();
    let space = match ImageSpace::create(&path, &lock) {
        Ok(space) => space,
        Err(err) => {
            eprintln!("gc-spaces: {}", err);
            process::exit(1);
        }
    };

    let header = space.header();
    println!("image:            {}", space.image_filename().display());
    println!("version:          {}", String::from_utf8_lossy(header.version()).trim_end_matches('\0'));
    match header.image_begin() {
        Some(begin) => println!("requested begin:  {}", begin),
        None => println!("requested begin:  anywhere"),
    }
    println!("image size:       {}", formatted_size(header.image_size()));
    println!(
        "objects:          [{:#x}, {:#x})",
        header.objects_offset(),
        header.objects_end()
    );
    println!("object count:     {}", header.object_count());
    println!("checksum:         {:#010x}", header.checksum());
    println!("space:            {}", Space::from(space));
}
