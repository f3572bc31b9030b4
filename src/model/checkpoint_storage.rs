//! チェックポイントの永続化
//!
//! Tar.gz形式でモデルの重みとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス一覧、入力サイズ、検証精度など）
//! - model.bin       - モデルの重み（BinBytesRecorder形式）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::checkpoint_metadata::CheckpointMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const WEIGHTS_ENTRY: &str = "model.bin";

/// メタデータと共に重みをTar.gz形式で保存
///
/// 拡張子が `.gz` でなければ `.tar.gz` を付けます。実際に書き込んだパスを返します。
pub fn save_checkpoint(
    output_path: &Path,
    metadata: &CheckpointMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    };

    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, WEIGHTS_ENTRY, model_binary)?;

    // tarを閉じてからgzipストリームを閉じる
    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finalize gzip stream")?;

    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと重みバイナリを共に読み込む
pub fn load_checkpoint(tar_gz_path: &Path) -> Result<(CheckpointMetadata, Vec<u8>)> {
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<CheckpointMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries().context("Failed to read tar.gz entries")? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(CheckpointMetadata::from_json_string(&json_str)?);
            }
            WEIGHTS_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("{} not found in tar.gz archive", METADATA_ENTRY)),
        (_, None) => Err(anyhow::anyhow!("{} not found in tar.gz archive", WEIGHTS_ENTRY)),
    }
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}
