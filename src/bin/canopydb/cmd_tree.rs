use anyhow::Result;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use CanopyDB::Commit;

use super::util::{decode_key_arg, decode_value_arg, display_text, open_store, to_hex};

pub fn exec_put(path: PathBuf, tree: String, key: String, value: String) -> Result<()> {
    let k = decode_key_arg(&key)?;
    let v = decode_value_arg(&value)?;
    let (store, db) = open_store(&path)?;
    db.open_btree_map(&tree)?.put(&k, &v)?;
    let chunk = store.commit(Commit::best_effort())?;
    store.close()?;
    match chunk {
        Some(c) => println!("OK put '{}' ({} B) -> v{} ({} page(s))", key, v.len(), c.version, c.page_count),
        None => println!("OK put '{}' (unchanged)", key),
    }
    Ok(())
}

pub fn exec_get(path: PathBuf, tree: String, key: String, out: Option<PathBuf>) -> Result<()> {
    let k = decode_key_arg(&key)?;
    let (store, db) = open_store(&path)?;
    let found = db.open_btree_map(&tree)?.get(&k)?;
    store.close()?;
    match found {
        Some(v) => {
            if let Some(out_path) = out {
                if let Some(parent) = out_path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let mut f = OpenOptions::new()
                    .create(true)
                    .truncate(true)
                    .write(true)
                    .open(&out_path)?;
                f.write_all(&v)?;
                f.sync_all()?;
                println!("FOUND '{}': {} B -> wrote to {}", key, v.len(), out_path.display());
            } else {
                println!("FOUND '{}': {} B", key, v.len());
                println!("text: {}", display_text(&v));
                println!("hex:  {}", to_hex(&v[..v.len().min(64)]));
            }
        }
        None => println!("NOT FOUND '{}'", key),
    }
    Ok(())
}

pub fn exec_del(path: PathBuf, tree: String, key: String) -> Result<()> {
    let k = decode_key_arg(&key)?;
    let (store, db) = open_store(&path)?;
    let removed = db.open_btree_map(&tree)?.remove(&k)?;
    store.commit(Commit::best_effort())?;
    store.close()?;
    if removed {
        println!("DELETED '{}'", key);
    } else {
        println!("NOT FOUND '{}'", key);
    }
    Ok(())
}

pub fn exec_scan(path: PathBuf, tree: String, from: Option<String>, limit: Option<usize>, json: bool) -> Result<()> {
    let (store, db) = open_store(&path)?;
    let map = db.open_btree_map(&tree)?;
    let cursor = match from {
        Some(f) => map.cursor_from(&decode_key_arg(&f)?)?,
        None => map.cursor()?,
    };
    let mut count = 0usize;
    for slot in cursor.take(limit.unwrap_or(usize::MAX)) {
        let (k, v) = slot?;
        if json {
            let line = serde_json::json!({
                "key": display_text(&k),
                "key_hex": to_hex(&k),
                "value": display_text(&v),
                "value_len": v.len(),
            });
            println!("{}", line);
        } else {
            println!("{} = {}", display_text(&k), display_text(&v));
        }
        count += 1;
    }
    store.close()?;
    if !json {
        println!("({} entries)", count);
    }
    Ok(())
}

pub fn exec_append(path: PathBuf, list: String, key: String, value: String) -> Result<()> {
    let k = decode_key_arg(&key)?;
    let v = decode_value_arg(&value)?;
    let (store, db) = open_store(&path)?;
    let handle = db.open_stree_list(&list)?;
    handle.append(&k, &v)?;
    let len = handle.len()?;
    store.commit(Commit::best_effort())?;
    store.close()?;
    println!("OK appended to '{}' (len {})", list, len);
    Ok(())
}
