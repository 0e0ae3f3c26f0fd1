//! 評価関数学習コマンド
//!
//! # 使用例
//!
//! ```bash
//! # バッチ学習（深さ2、4スレッド、8反復）
//! cargo run -p shiden-learn --bin learn -- \
//!   --kifu kifu --threads 4 --depth 2 batch --iteration 8
//!
//! # オンライン学習
//! cargo run -p shiden-learn --bin learn -- \
//!   --kifu kifu --threads 4 --depth 2 online
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use shiden_core::eval::Evaluator;
use shiden_learn::{BatchLearning, LearnConfig, OnlineLearning};

#[derive(Parser)]
#[command(name = "learn", version, about = "棋譜から評価関数を学習する")]
struct Cli {
    /// 棋譜（.csa）のディレクトリ
    #[arg(long, default_value = "kifu")]
    kifu: PathBuf,

    /// ワーカースレッド数
    #[arg(long, short, default_value_t = 1)]
    threads: usize,

    /// 基本探索深さ
    #[arg(long, short, default_value_t = 2)]
    depth: i32,

    /// 評価関数ファイル
    #[arg(long, default_value = "eval.bin")]
    eval: PathBuf,

    /// 駒割ファイル
    #[arg(long, default_value = "material.bin")]
    material: PathBuf,

    /// 訓練データの一時ファイル（バッチのみ）
    #[arg(long, default_value = "training.dat")]
    training_file: PathBuf,

    /// シード値
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// 反復ごとの統計を書き出すJSONLファイル
    #[arg(long)]
    log_json: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// バッチ学習（全棋譜から訓練データを作り、勾配反復で更新する）
    Batch {
        /// 反復回数
        #[arg(long, short, default_value_t = 32)]
        iteration: u32,
    },
    /// オンライン学習（平均化パーセプトロン）
    Online,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = LearnConfig {
        kifu_dir: cli.kifu,
        threads: cli.threads,
        depth: cli.depth,
        eval_file: cli.eval,
        material_file: cli.material,
        training_file: cli.training_file,
        seed: cli.seed,
        log_json: cli.log_json,
        ..LearnConfig::default()
    };

    // 重みはゼロから。駒割のチェックポイントがあれば引き継ぐ。
    let eval = Arc::new(Evaluator::new());
    if config.material_file.exists() {
        eval.material.load(&config.material_file)?;
        log::info!("loaded material from {}", config.material_file.display());
    }

    match cli.mode {
        Mode::Batch { iteration } => {
            config.iteration = iteration;
            BatchLearning::new(config, eval)?.run()
        }
        Mode::Online => OnlineLearning::new(config, eval)?.run(),
    }
}
