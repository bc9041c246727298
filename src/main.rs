use std::{env, fs, io, io::Read, process};

use anyhow::Result;
use blockgz::{Reader, ThreadPool, WriterBuilder};

fn compress_file(ipath: &str, opath: &str, threads: usize) -> Result<()> {
    let mut input = io::BufReader::new(fs::File::open(ipath)?);
    let mut writer = WriterBuilder::default().create(opath)?;
    if threads > 1 {
        let pool = ThreadPool::new(threads);
        writer.attach_pool(&pool, 2 * threads)?;
    }

    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n])?;
    }
    writer.finish()?;

    let mut index = io::BufWriter::new(fs::File::create(format!("{opath}.gzi"))?);
    writer.index_dump(&mut index)?;
    Ok(())
}

fn decompress_file(ipath: &str, threads: usize) -> Result<()> {
    let mut reader = Reader::open(ipath)?;
    if threads > 1 {
        let pool = ThreadPool::new(threads);
        reader.attach_pool(&pool, 2 * threads)?;
    }
    let mut stdout = io::BufWriter::new(io::stdout());
    io::copy(&mut reader, &mut stdout)?;
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let threads = num_cpus::get();
    match args.get(1).map(String::as_str) {
        Some("compress") if args.len() == 4 => compress_file(&args[2], &args[3], threads)?,
        Some("decompress") if args.len() == 3 => decompress_file(&args[2], threads)?,
        _ => {
            eprintln!("usage: blockgz compress <input> <output> | decompress <input>");
            process::exit(2);
        }
    }
    Ok(())
}
