mod cli;

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::sync::Arc;
use std::sync::Mutex;

use clap::Parser;
use cli::Cli;
use log::warn;
use tier_fs::TierFs;
use tier_fs::CACHE_SLOTS;
use tier_fs::MAX_LENGTH;
use tier_fs::NAME_MAX;
use tier_fs::SECTOR_SIZE;
use tier_fs_fuse::BlockFile;

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    println!(
        "source={:?}\nimage={:?} ({} sectors)",
        cli.source,
        cli.out_dir.join("fs.img"),
        cli.sectors
    );

    let block_file = Arc::new(BlockFile(Mutex::new({
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(cli.out_dir.join("fs.img"))?;
        fd.set_len(cli.sectors as u64 * SECTOR_SIZE as u64).unwrap();

        fd
    })));

    let fs = TierFs::format(block_file, cli.sectors, CACHE_SLOTS)
        .expect("volume too small for its own metadata");
    let root = fs.root();

    for entry in fs::read_dir(&cli.source)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            warn!("skipping {:?}: name is not unicode", entry.file_name());
            continue;
        };
        if name.len() > NAME_MAX {
            warn!("skipping {name}: name longer than {NAME_MAX} bytes");
            continue;
        }

        let mut host_file = File::open(entry.path())?;
        let mut data: Vec<u8> = Vec::new();
        host_file.read_to_end(&mut data)?;
        if data.len() > MAX_LENGTH as usize {
            warn!("skipping {name}: {} bytes exceed the file size limit", data.len());
            continue;
        }

        println!("packing: {name:?} ({} bytes)", data.len());
        assert!(
            fs.create_file(&root, &name, data.len() as u32),
            "creating {name} failed, volume is likely full"
        );
        let inode = fs.open_file(&root, &name).unwrap();
        assert_eq!(inode.write_at(0, &data), data.len());
        fs.close(inode);
    }

    fs.close_dir(root);
    fs.unmount();
    Ok(())
}
