//! framesmith - Library
//!
//! バイナリターゲット（schema生成など）からプロジェクトのモジュールに
//! アクセスするために提供されています。

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod logging;
