use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use stratus_operator::{generate_key_material, EncryptionKeyMaterial, Encrypter, NodeConfig};

#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "Key and node bootstrap tooling for stratus clusters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a fresh encryption key and initial vector
    Keygen {
        /// Print as JSON instead of shell variables
        #[arg(long)]
        json: bool,
    },

    /// Encrypt a file (or stdin) and print the ciphertext as hex
    Encrypt {
        /// Encryption key (64 hex chars)
        #[arg(long, env = "STRATUS_ENCRYPTION_KEY")]
        key: String,

        /// Initial vector (32 hex chars)
        #[arg(long, env = "STRATUS_INITIAL_VECTOR")]
        iv: String,

        /// Input file, stdin if omitted
        input: Option<PathBuf>,
    },

    /// Decrypt hex ciphertext from a file (or stdin)
    Decrypt {
        /// Encryption key (64 hex chars)
        #[arg(long, env = "STRATUS_ENCRYPTION_KEY")]
        key: String,

        /// Initial vector (32 hex chars)
        #[arg(long, env = "STRATUS_INITIAL_VECTOR")]
        iv: String,

        /// Input file, stdin if omitted
        input: Option<PathBuf>,
    },

    /// Show the contents of a node bootstrap document
    Inspect {
        /// Encryption key from the scale set model (64 hex chars)
        #[arg(long, env = "STRATUS_ENCRYPTION_KEY")]
        key: String,

        /// Initial vector from the scale set model (32 hex chars)
        #[arg(long, env = "STRATUS_INITIAL_VECTOR")]
        iv: String,

        /// Bootstrap document (JSON)
        document: PathBuf,
    },

    /// Decrypt the files of a bootstrap document into a directory
    Unpack {
        /// Encryption key from the scale set model (64 hex chars)
        #[arg(long, env = "STRATUS_ENCRYPTION_KEY")]
        key: String,

        /// Initial vector from the scale set model (32 hex chars)
        #[arg(long, env = "STRATUS_INITIAL_VECTOR")]
        iv: String,

        /// Bootstrap document (JSON)
        document: PathBuf,

        /// Root directory the file paths are resolved against
        #[arg(long, default_value = "/")]
        root: PathBuf,
    },
}

#[derive(Tabled)]
struct FileRow {
    #[tabled(rename = "PATH")]
    path: String,
    #[tabled(rename = "BYTES")]
    bytes: usize,
}

async fn read_input(input: Option<&Path>) -> Result<Vec<u8>> {
    if let Some(path) = input {
        return tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    let mut buf = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut buf)
        .await
        .context("Failed to read stdin")?;
    Ok(buf)
}

fn key_material(key: &str, iv: &str) -> Result<EncryptionKeyMaterial> {
    EncryptionKeyMaterial::from_hex(key.trim(), iv.trim()).context("Invalid key material")
}

fn encrypter(key: &str, iv: &str) -> Result<Encrypter> {
    key_material(key, iv).map(Encrypter::new)
}

async fn load_document(path: &Path) -> Result<NodeConfig> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("{} is not a bootstrap document", path.display()))
}

/// Where an absolute node path lands below `root`. Rejects `..` components.
fn unpack_target(root: &Path, file: &str) -> Result<PathBuf> {
    let relative = Path::new(file.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        bail!("Empty file path in bootstrap document");
    }
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        bail!("Refusing to unpack {}: path escapes the root", file);
    }
    Ok(root.join(relative))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { json } => {
            let encrypter = Encrypter::new(generate_key_material());
            if json {
                let doc = serde_json::json!({
                    "encryption_key": encrypter.encryption_key(),
                    "initial_vector": encrypter.initial_vector(),
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                println!("STRATUS_ENCRYPTION_KEY={}", encrypter.encryption_key());
                println!("STRATUS_INITIAL_VECTOR={}", encrypter.initial_vector());
            }
        }

        Commands::Encrypt { key, iv, input } => {
            let encrypter = encrypter(&key, &iv)?;
            let plaintext = read_input(input.as_deref()).await?;
            println!("{}", hex::encode(encrypter.encrypt(&plaintext)));
        }

        Commands::Decrypt { key, iv, input } => {
            let encrypter = encrypter(&key, &iv)?;
            let raw = read_input(input.as_deref()).await?;
            let text = String::from_utf8(raw).context("Ciphertext is not hex text")?;
            let ciphertext = hex::decode(text.trim()).context("Ciphertext is not valid hex")?;

            let mut stdout = tokio::io::stdout();
            stdout.write_all(&encrypter.decrypt(&ciphertext)).await?;
            stdout.flush().await?;
        }

        Commands::Inspect { key, iv, document } => {
            let material = key_material(&key, &iv)?;
            let config = load_document(&document).await?;
            println!("Cluster:  {}", config.cluster_id);
            println!("Fleet:    {}", config.fleet);
            println!("Version:  {}", config.version);
            println!("VM size:  {}", config.vm_size);

            let files = config.decrypt_files(&material)?;
            if files.is_empty() {
                println!("No files");
            } else {
                let rows: Vec<FileRow> = files
                    .iter()
                    .map(|(path, content)| FileRow {
                        path: path.clone(),
                        bytes: content.len(),
                    })
                    .collect();
                println!("{}", Table::new(rows));
            }
        }

        Commands::Unpack {
            key,
            iv,
            document,
            root,
        } => {
            let material = key_material(&key, &iv)?;
            let config = load_document(&document).await?;
            for (file, content) in config.decrypt_files(&material)? {
                let target = unpack_target(&root, &file)?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                tokio::fs::write(&target, &content)
                    .await
                    .with_context(|| format!("Failed to write {}", target.display()))?;
                println!("Wrote {} ({} bytes)", target.display(), content.len());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpack_target_strips_leading_slash() {
        let target = unpack_target(Path::new("/tmp/root"), "/etc/ssl/ca.pem").unwrap();
        assert_eq!(target, PathBuf::from("/tmp/root/etc/ssl/ca.pem"));
    }

    #[test]
    fn test_unpack_target_rejects_escape() {
        assert!(unpack_target(Path::new("/tmp/root"), "/etc/../../passwd").is_err());
        assert!(unpack_target(Path::new("/tmp/root"), "/").is_err());
    }

    #[test]
    fn test_encrypter_rejects_short_key() {
        assert!(encrypter("abcd", &"00".repeat(16)).is_err());
    }

    #[tokio::test]
    async fn test_read_input_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(read_input(Some(path.as_path())).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_load_document_round_trip() {
        let material = generate_key_material();
        let encrypter = Encrypter::new(material.clone());
        let mut files = std::collections::BTreeMap::new();
        files.insert(
            "/etc/ssl/ca.pem".to_string(),
            hex::encode(encrypter.encrypt(b"CA")),
        );
        let config = NodeConfig {
            cluster_id: "c1".into(),
            fleet: "workers".into(),
            version: "1.0.0".into(),
            vm_size: "Standard_D4s_v3".into(),
            files,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        let loaded = load_document(&path).await.unwrap();
        assert_eq!(loaded, config);

        let supplied = key_material(&encrypter.encryption_key(), &encrypter.initial_vector());
        assert_eq!(
            loaded.decrypt_files(&supplied.unwrap()).unwrap()["/etc/ssl/ca.pem"],
            b"CA".to_vec()
        );
    }

    #[test]
    fn test_unpack_takes_key_and_iv() {
        let cli = Cli::try_parse_from([
            "stratus",
            "unpack",
            "--key",
            "aa",
            "--iv",
            "bb",
            "--root",
            "/tmp/root",
            "/tmp/workers.json",
        ])
        .unwrap();
        match cli.command {
            Commands::Unpack { key, iv, root, .. } => {
                assert_eq!(key, "aa");
                assert_eq!(iv, "bb");
                assert_eq!(root, PathBuf::from("/tmp/root"));
            }
            _ => panic!("expected unpack"),
        }
    }
}
