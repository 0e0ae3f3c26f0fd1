//! 駒割（Material）
//!
//! 学習対象となる13駒種の基本値と、そこから導出される交換値・成り価値を
//! 保持する。探索ワーカーは読むだけで、更新は駆動スレッドがワーカーの
//! 停止中にのみ行う。そのため Ordering::Relaxed のアトミックで十分。

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{bail, Context, Result};

use crate::types::{PieceType, Value};

/// 学習対象の駒種数（玉を除く）
pub const MATERIAL_COUNT: usize = 13;

/// 駒種 -> 駒割スロット（玉は None）
#[inline]
pub const fn material_slot(pt: PieceType) -> Option<usize> {
    match pt {
        PieceType::Pawn => Some(0),
        PieceType::Lance => Some(1),
        PieceType::Knight => Some(2),
        PieceType::Silver => Some(3),
        PieceType::Gold => Some(4),
        PieceType::Bishop => Some(5),
        PieceType::Rook => Some(6),
        PieceType::ProPawn => Some(7),
        PieceType::ProLance => Some(8),
        PieceType::ProKnight => Some(9),
        PieceType::ProSilver => Some(10),
        PieceType::Horse => Some(11),
        PieceType::Dragon => Some(12),
        PieceType::King => None,
    }
}

const SLOT_PIECES: [PieceType; MATERIAL_COUNT] = [
    PieceType::Pawn,
    PieceType::Lance,
    PieceType::Knight,
    PieceType::Silver,
    PieceType::Gold,
    PieceType::Bishop,
    PieceType::Rook,
    PieceType::ProPawn,
    PieceType::ProLance,
    PieceType::ProKnight,
    PieceType::ProSilver,
    PieceType::Horse,
    PieceType::Dragon,
];

/// Apery(WCSC26)準拠の初期値
const DEFAULT_BASE: [i32; MATERIAL_COUNT] =
    [90, 315, 405, 495, 540, 855, 990, 540, 540, 540, 540, 945, 1395];

pub struct Material {
    base: [AtomicI32; MATERIAL_COUNT],
    exchange: [AtomicI32; MATERIAL_COUNT],
}

impl Material {
    pub fn new() -> Material {
        let m = Material {
            base: std::array::from_fn(|i| AtomicI32::new(DEFAULT_BASE[i])),
            exchange: std::array::from_fn(|_| AtomicI32::new(0)),
        };
        m.rebuild_exchange();
        m
    }

    /// 駒割を取得（先後の区別なし）
    #[inline]
    pub fn value(&self, pt: PieceType) -> i32 {
        match material_slot(pt) {
            Some(i) => self.base[i].load(Ordering::Relaxed),
            None => Value::PIECE_INF.raw(),
        }
    }

    /// 駒を取った時の変化値（相手の損 + 自分の持ち駒の得）
    #[inline]
    pub fn exchange_value(&self, pt: PieceType) -> i32 {
        match material_slot(pt) {
            Some(i) => self.exchange[i].load(Ordering::Relaxed),
            None => Value::PIECE_INF.raw() * 2,
        }
    }

    /// 駒が成った時の変化値
    #[inline]
    pub fn promotion_gain(&self, pt: PieceType) -> i32 {
        match pt.promote() {
            Some(promoted) => self.value(promoted) - self.value(pt),
            None => 0,
        }
    }

    /// 交換値テーブルを基本値から再生成する
    pub fn rebuild_exchange(&self) {
        for (i, pt) in SLOT_PIECES.iter().enumerate() {
            let ex = self.base[i].load(Ordering::Relaxed)
                + self.value(pt.unpromote());
            self.exchange[i].store(ex, Ordering::Relaxed);
        }
    }

    /// 基本値のスナップショット
    pub fn bases(&self) -> [i32; MATERIAL_COUNT] {
        std::array::from_fn(|i| self.base[i].load(Ordering::Relaxed))
    }

    /// 13スロットへ差分を適用し、交換値を再生成する
    ///
    /// 成駒の値が生駒を下回らないよう適用後に切り上げる。
    pub fn apply_deltas(&self, deltas: &[i32; MATERIAL_COUNT]) {
        for i in 0..MATERIAL_COUNT {
            self.base[i].fetch_add(deltas[i], Ordering::Relaxed);
        }
        for (i, pt) in SLOT_PIECES.iter().enumerate() {
            if pt.is_promoted() {
                let floor = self.value(pt.unpromote());
                if self.base[i].load(Ordering::Relaxed) < floor {
                    self.base[i].store(floor, Ordering::Relaxed);
                }
            }
        }
        self.rebuild_exchange();
    }

    /// 13個の i32 (little-endian) として書き出す
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut f = File::create(path)
            .with_context(|| format!("cannot create material file: {}", path.display()))?;
        for v in self.bases() {
            f.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    /// `save` の逆変換
    pub fn load(&self, path: &Path) -> Result<()> {
        let mut f = File::open(path)
            .with_context(|| format!("cannot open material file: {}", path.display()))?;
        let mut buf = [0u8; MATERIAL_COUNT * 4];
        f.read_exact(&mut buf).context("material file too short")?;
        let mut rest = [0u8; 1];
        if f.read(&mut rest)? != 0 {
            bail!("material file too long: {}", path.display());
        }
        for i in 0..MATERIAL_COUNT {
            let v = i32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
            self.base[i].store(v, Ordering::Relaxed);
        }
        self.rebuild_exchange();
        Ok(())
    }
}

impl Default for Material {
    fn default() -> Self {
        Material::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_same_value_for_both_colors() {
        let m = Material::new();
        // PieceType は先後を持たないのでそのまま同値
        assert_eq!(m.value(PieceType::Pawn), 90);
        assert_eq!(m.value(PieceType::Dragon), 1395);
        assert_eq!(m.value(PieceType::King), Value::PIECE_INF.raw());
    }

    #[test]
    fn test_exchange_values() {
        let m = Material::new();
        // 生駒: base * 2
        assert_eq!(m.exchange_value(PieceType::Pawn), 180);
        // 成駒: base + 生駒のbase（取られると生駒に戻る）
        assert_eq!(m.exchange_value(PieceType::ProPawn), 540 + 90);
        assert_eq!(m.exchange_value(PieceType::Dragon), 1395 + 990);
    }

    #[test]
    fn test_promotion_gain() {
        let m = Material::new();
        assert_eq!(m.promotion_gain(PieceType::Pawn), 540 - 90);
        assert_eq!(m.promotion_gain(PieceType::Gold), 0);
        assert_eq!(m.promotion_gain(PieceType::King), 0);
    }

    #[test]
    fn test_apply_deltas_rebuilds_and_clamps() {
        let m = Material::new();
        let mut deltas = [0i32; MATERIAL_COUNT];
        deltas[0] = 2; // Pawn 90 -> 92
        deltas[7] = -500; // ProPawn 540 -> 40 だが歩(92)未満には落ちない
        m.apply_deltas(&deltas);
        assert_eq!(m.value(PieceType::Pawn), 92);
        assert_eq!(m.value(PieceType::ProPawn), 92);
        assert_eq!(m.exchange_value(PieceType::Pawn), 184);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("material.bin");

        let m = Material::new();
        let mut deltas = [0i32; MATERIAL_COUNT];
        deltas[6] = -10;
        m.apply_deltas(&deltas);
        m.save(&path).unwrap();

        let loaded = Material::new();
        loaded.load(&path).unwrap();
        assert_eq!(loaded.bases(), m.bases());
        assert_eq!(
            loaded.exchange_value(PieceType::Rook),
            m.exchange_value(PieceType::Rook)
        );
    }
}
