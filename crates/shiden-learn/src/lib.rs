//! shiden-learn: 評価関数学習の中核
//!
//! 棋譜からPV訓練例を並列生成し、バッチ（勾配反復）とオンライン
//! （平均化パーセプトロン）の2方式で KPP/KKP 重みと駒割を調整する。

pub mod batch;
pub mod config;
pub mod corpus;
pub mod logging;
pub mod online;
pub mod pool;
pub mod training_set;

pub use batch::BatchLearning;
pub use config::LearnConfig;
pub use online::OnlineLearning;
