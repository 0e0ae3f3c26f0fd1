//! 評価値キャッシュ
//!
//! xor パックした2本のアトミックで1エントリを表す簡易ハッシュ表。
//! 破損エントリは検証キーの不一致で弾かれるのでロックは不要。

use std::sync::atomic::{AtomicU64, Ordering};

const FILLED: u64 = 1 << 32;

struct Entry {
    key: AtomicU64,
    data: AtomicU64,
}

pub struct EvalCache {
    table: Box<[Entry]>,
    mask: usize,
}

impl EvalCache {
    /// `size_pow2` エントリ（2のべき乗）で確保する
    pub fn new(size_pow2: usize) -> EvalCache {
        debug_assert!(size_pow2.is_power_of_two());
        let table = (0..size_pow2)
            .map(|_| Entry {
                key: AtomicU64::new(0),
                data: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        EvalCache {
            table,
            mask: size_pow2 - 1,
        }
    }

    #[inline]
    pub fn probe(&self, hash: u64) -> Option<i32> {
        let e = &self.table[(hash as usize) & self.mask];
        let key = e.key.load(Ordering::Relaxed);
        let data = e.data.load(Ordering::Relaxed);
        if data & FILLED != 0 && key ^ data == hash {
            Some(data as u32 as i32)
        } else {
            None
        }
    }

    #[inline]
    pub fn store(&self, hash: u64, score: i32) {
        let e = &self.table[(hash as usize) & self.mask];
        let data = FILLED | (score as u32 as u64);
        e.data.store(data, Ordering::Relaxed);
        e.key.store(hash ^ data, Ordering::Relaxed);
    }

    /// 全エントリを無効化する
    pub fn clear(&self) {
        for e in self.table.iter() {
            e.key.store(0, Ordering::Relaxed);
            e.data.store(0, Ordering::Relaxed);
        }
    }
}
