use anyhow::Result;
use std::sync::Arc;

use CanopyDB::page::TreeContext;
use CanopyDB::stree::STree;
use CanopyDB::{bytes, ArityPolicy, Bytes};

fn cx(split: usize) -> TreeContext {
    TreeContext::new(7, Arc::new(ArityPolicy::new(split)))
}

fn id(i: u32) -> Bytes {
    bytes(format!("id-{}", i).as_bytes())
}

/// Positional inserts/updates/removes against a Vec model.
#[test]
fn random_positional_edits_match_model() -> Result<()> {
    let cx = cx(6);
    let mut rng = oorandom::Rand32::new(42);
    let mut model: Vec<(Bytes, Bytes)> = Vec::new();
    let mut t = STree::empty(1);
    let mut next_id = 0u32;

    for step in 0..3000u32 {
        let version = 1 + (step / 50) as u64;
        let len = model.len() as u32;
        match rng.rand_range(0..6) {
            0 | 1 | 2 => {
                let at = rng.rand_range(0..len + 1);
                let slot = (id(next_id), bytes(&step.to_le_bytes()));
                next_id += 1;
                t = t.inserted(&cx, at as u64, slot.0.clone(), slot.1.clone(), version)?;
                model.insert(at as usize, slot);
            }
            3 if len > 0 => {
                let at = rng.rand_range(0..len);
                let v = bytes(&(step * 7).to_le_bytes());
                t = t.updated(&cx, at as u64, v.clone(), version)?;
                model[at as usize].1 = v;
            }
            _ if len > 0 => {
                let at = rng.rand_range(0..len);
                t = t.removed(&cx, at as u64, version)?;
                model.remove(at as usize);
            }
            _ => {}
        }
        if step % 50 == 49 {
            t = t.balanced(&cx, version)?;
        }
        assert_eq!(t.len(), model.len() as u64);
    }

    assert_eq!(t.entries(&cx)?, model);
    for (i, (k, v)) in model.iter().enumerate() {
        assert_eq!(t.get(&cx, i as u64)?.as_ref(), Some(v));
        assert_eq!(t.index_of(&cx, k)?, Some(i as u64));
    }
    Ok(())
}

#[test]
fn drop_then_take_is_a_suffix() -> Result<()> {
    for split in [2usize, 4, 32] {
        let cx = cx(split);
        let mut t = STree::empty(1);
        for i in 0..300u32 {
            t = t.appended(&cx, id(i), bytes(&i.to_le_bytes()), 1)?;
            if i % 10 == 0 {
                t = t.balanced(&cx, 1)?;
            }
        }
        t = t.balanced(&cx, 1)?;
        let all = t.entries(&cx)?;
        let n = t.len();
        for k in [0u64, 1, 2, 99, 150, 299, 300] {
            let rest = t.drop(&cx, k, 2)?.take(&cx, n - k, 2)?;
            assert_eq!(rest.len(), n - k, "split {} k {}", split, k);
            assert_eq!(rest.entries(&cx)?, all[k as usize..].to_vec(), "split {} k {}", split, k);
            if k < n {
                assert_eq!(rest.get(&cx, 0)?, Some(all[k as usize].1.clone()));
            }
        }
    }
    Ok(())
}

#[test]
fn out_of_range_positions() -> Result<()> {
    let cx = cx(4);
    let t = STree::empty(1).appended(&cx, id(0), bytes(b"a"), 1)?;
    assert!(t.inserted(&cx, 2, id(1), bytes(b"b"), 1).is_err());
    assert!(t.updated(&cx, 1, bytes(b"b"), 1).is_err());
    assert!(t.removed(&cx, 1, 1)?.same_root(&t));
    assert_eq!(t.get(&cx, 1)?, None);
    Ok(())
}
