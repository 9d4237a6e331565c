//! Minimal operational front-end for `pkgcache`.
//!
//! Not part of the cache core itself -- this binary only exists so the
//! crate is runnable from a shell, the same way `pbs-datastore` is
//! fronted by `proxmox-backup-client`.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};
use pkgcache::{Cache, CacheConfig};

fn usage() -> ! {
    eprintln!(
        "usage: pkgcache-cli --base <dir> --max-size <bytes> <command> [args..]\n\n\
         commands:\n  \
         put <digest> <filename> <path>   stage and commit a file by its sha256 digest\n  \
         get <digest> <out-path>          write a cached blob to out-path\n  \
         rm <digest>                      delete a cached blob\n  \
         ls                               list all cached records\n  \
         stat                             print aggregate statistics\n  \
         gc                               run admission/eviction bookkeeping\n"
    );
    std::process::exit(2);
}

struct Args {
    base: PathBuf,
    max_size: u64,
    min_free_bytes: u64,
    rest: Vec<String>,
}

fn parse_args() -> Args {
    let mut base = None;
    let mut max_size = 10u64 * 1024 * 1024 * 1024;
    let mut min_free_bytes = 0u64;
    let mut rest = Vec::new();

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--base" => base = iter.next().map(PathBuf::from),
            "--max-size" => {
                max_size = iter
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage())
            }
            "--min-free" => {
                min_free_bytes = iter
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage())
            }
            other => rest.push(other.to_string()),
        }
    }

    let Some(base) = base else { usage() };
    Args {
        base,
        max_size,
        min_free_bytes,
        rest,
    }
}

fn run(cache: &Cache, command: &str, args: &[String]) -> Result<(), Error> {
    match command {
        "put" => {
            let [digest, filename, path] = args else {
                bail!("put requires <digest> <filename> <path>");
            };
            let mut file = File::open(path)
                .map_err(|err| format_err!("unable to open {path}: {err}"))?;
            let record = cache.put_stream(&mut file, digest, filename)?;
            println!("stored {} ({} bytes)", record.digest, record.size);
        }
        "get" => {
            let [digest, out_path] = args else {
                bail!("get requires <digest> <out-path>");
            };
            let (mut handle, record) = cache.get(digest)?;
            let mut contents = Vec::new();
            handle.read_to_end(&mut contents)?;
            std::fs::write(out_path, contents)?;
            println!("wrote {} bytes for {}", record.size, record.digest);
        }
        "rm" => {
            let [digest] = args else {
                bail!("rm requires <digest>");
            };
            cache.delete(digest)?;
            println!("removed {digest}");
        }
        "ls" => {
            for record in cache.list()? {
                println!(
                    "{}  {:>10}  {:<40}  accesses={}",
                    record.digest, record.size, record.filename, record.access_count
                );
            }
        }
        "stat" => {
            let stats = cache.stats()?;
            println!("{stats:#?}");
        }
        "gc" => {
            let updated = cache.populate_missing_metadata()?;
            println!("populated metadata for {updated} record(s)");
        }
        other => bail!("unknown command '{other}'"),
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    env_logger::init();
    let args = parse_args();

    let cache = Cache::open(CacheConfig {
        base: args.base,
        max_size: args.max_size,
        min_free_bytes: args.min_free_bytes,
    })
    .map_err(|err| format_err!("unable to open cache: {err}"))?;

    let Some((command, rest)) = args.rest.split_first() else {
        usage();
    };

    if let Err(err) = run(&cache, command, rest) {
        log::error!("{err}");
        std::process::exit(1);
    }

    Ok(())
}
