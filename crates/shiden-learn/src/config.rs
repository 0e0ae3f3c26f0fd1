//! 学習設定

use std::path::PathBuf;

/// 学習設定
///
/// バッチ・オンラインの両駆動部が共通に使う。
#[derive(Debug, Clone)]
pub struct LearnConfig {
    /// 棋譜（.csa）のディレクトリ
    pub kifu_dir: PathBuf,
    /// ワーカースレッド数
    pub threads: usize,
    /// 基本探索深さ
    pub depth: i32,
    /// 反復回数（バッチのみ）
    pub iteration: u32,
    /// 評価関数ファイル
    pub eval_file: PathBuf,
    /// 駒割ファイル
    pub material_file: PathBuf,
    /// 訓練データの一時ファイル（バッチのみ）
    pub training_file: PathBuf,
    /// シード値
    pub seed: u64,
    /// 反復ごとの統計を書き出すJSONLファイル（省略可）
    pub log_json: Option<PathBuf>,
}

impl Default for LearnConfig {
    fn default() -> Self {
        LearnConfig {
            kifu_dir: PathBuf::from("kifu"),
            threads: 1,
            depth: 2,
            iteration: 32,
            eval_file: PathBuf::from("eval.bin"),
            material_file: PathBuf::from("material.bin"),
            training_file: PathBuf::from("training.dat"),
            seed: 42,
            log_json: None,
        }
    }
}
