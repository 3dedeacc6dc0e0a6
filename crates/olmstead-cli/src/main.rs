//! Olmstead command line tools.
//!
//! # Usage
//!
//! ```bash
//! # Encrypt a file for upload; the descriptor carries key, IV and digest
//! olmstead encrypt-attachment photo.jpg photo.enc --descriptor photo.json
//!
//! # Decrypt it again, verifying the digest
//! olmstead decrypt-attachment photo.enc photo.jpg --descriptor photo.json
//!
//! # Open a room key export and write the session list as JSON
//! OLMSTEAD_PASSPHRASE=... olmstead decrypt-key-export keys.txt keys.json
//! ```

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use olmstead_core::{Environment, SystemEnv, wire::ExportedRoomKey};
use olmstead_crypto::{
    AttachmentDecryptor, AttachmentEncryptor, AttachmentError, AttachmentKey, DEFAULT_EXPORT_ROUNDS,
    EncryptedAttachmentDescriptor, KeyExportError, attachment_error_from_io, decrypt_key_export, encrypt_key_export,
};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Olmstead command line tools
#[derive(Parser, Debug)]
#[command(name = "olmstead")]
#[command(about = "Encrypted attachments and room key export files")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encrypt a file with a fresh attachment key
    EncryptAttachment {
        /// Plaintext file
        input: PathBuf,
        /// Ciphertext file to write
        output: PathBuf,
        /// Where to write the JSON descriptor
        #[arg(long)]
        descriptor: PathBuf,
    },

    /// Decrypt an attachment and verify its digest
    DecryptAttachment {
        /// Ciphertext file
        input: PathBuf,
        /// Plaintext file to write; removed again if verification fails
        output: PathBuf,
        /// JSON descriptor produced at encryption time
        #[arg(long)]
        descriptor: PathBuf,
    },

    /// Wrap a JSON list of room keys into an export file
    EncryptKeyExport {
        /// JSON room key list
        input: PathBuf,
        /// Armoured export file to write
        output: PathBuf,
        /// Export passphrase
        #[arg(long, env = "OLMSTEAD_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
        /// PBKDF2 rounds
        #[arg(long, default_value_t = DEFAULT_EXPORT_ROUNDS)]
        rounds: u32,
    },

    /// Open an export file and write its room keys as JSON
    DecryptKeyExport {
        /// Armoured export file
        input: PathBuf,
        /// JSON file to write
        output: PathBuf,
        /// Export passphrase
        #[arg(long, env = "OLMSTEAD_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
    },
}

/// Command failures.
#[derive(Error, Debug)]
enum CliError {
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Attachment(#[from] AttachmentError),

    #[error(transparent)]
    KeyExport(#[from] KeyExportError),

    #[error("invalid JSON in {}: {reason}", path.display())]
    Json { path: PathBuf, reason: String },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CliError + '_ {
    move |source| CliError::Io { path: path.to_path_buf(), source }
}

fn main() -> Result<(), CliError> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer().with_writer(io::stderr)).with(filter).init();

    match args.command {
        Command::EncryptAttachment { input, output, descriptor } => {
            encrypt_attachment_file(&SystemEnv, &input, &output, &descriptor)
        },
        Command::DecryptAttachment { input, output, descriptor } => decrypt_attachment_file(&input, &output, &descriptor),
        Command::EncryptKeyExport { input, output, passphrase, rounds } => {
            encrypt_export_file(&SystemEnv, &input, &output, &passphrase, rounds)
        },
        Command::DecryptKeyExport { input, output, passphrase } => decrypt_export_file(&input, &output, &passphrase),
    }
}

fn encrypt_attachment_file(
    env: &impl Environment,
    input: &Path,
    output: &Path,
    descriptor_path: &Path,
) -> Result<(), CliError> {
    let reader = BufReader::new(File::open(input).map_err(io_error(input))?);
    let mut writer = BufWriter::new(File::create(output).map_err(io_error(output))?);

    let key = AttachmentKey::new(env.random_array(), env.random_array());
    let mut encryptor = AttachmentEncryptor::new(reader, key);
    let bytes = io::copy(&mut encryptor, &mut writer).map_err(io_error(input))?;
    writer.flush().map_err(io_error(output))?;

    let descriptor = encryptor.finish();
    let json = serde_json::to_vec_pretty(&descriptor)
        .map_err(|e| CliError::Json { path: descriptor_path.to_path_buf(), reason: e.to_string() })?;
    std::fs::write(descriptor_path, json).map_err(io_error(descriptor_path))?;

    info!(bytes, output = %output.display(), "encrypted attachment");
    Ok(())
}

fn decrypt_attachment_file(input: &Path, output: &Path, descriptor_path: &Path) -> Result<(), CliError> {
    let json = std::fs::read(descriptor_path).map_err(io_error(descriptor_path))?;
    let descriptor: EncryptedAttachmentDescriptor = serde_json::from_slice(&json)
        .map_err(|e| CliError::Json { path: descriptor_path.to_path_buf(), reason: e.to_string() })?;

    let reader = BufReader::new(File::open(input).map_err(io_error(input))?);
    let mut decryptor = AttachmentDecryptor::new(reader, &descriptor)?;
    let mut writer = BufWriter::new(File::create(output).map_err(io_error(output))?);

    let copied = io::copy(&mut decryptor, &mut writer).and_then(|bytes| writer.flush().map(|()| bytes));
    match copied {
        Ok(bytes) => {
            info!(bytes, output = %output.display(), "decrypted attachment");
            Ok(())
        },
        Err(err) => {
            drop(writer);
            // Partial plaintext of an unverified attachment must not survive.
            let _ = std::fs::remove_file(output);
            Err(attachment_error_from_io(&err).into())
        },
    }
}

fn encrypt_export_file(
    env: &impl Environment,
    input: &Path,
    output: &Path,
    passphrase: &str,
    rounds: u32,
) -> Result<(), CliError> {
    let plaintext = std::fs::read(input).map_err(io_error(input))?;
    let keys: Vec<ExportedRoomKey> = serde_json::from_slice(&plaintext)
        .map_err(|e| CliError::Json { path: input.to_path_buf(), reason: e.to_string() })?;

    let armored = encrypt_key_export(&plaintext, passphrase, rounds, env.random_array(), env.random_array())?;
    std::fs::write(output, armored).map_err(io_error(output))?;

    info!(sessions = keys.len(), rounds, output = %output.display(), "wrote key export");
    Ok(())
}

fn decrypt_export_file(input: &Path, output: &Path, passphrase: &str) -> Result<(), CliError> {
    let mut armored = String::new();
    File::open(input).and_then(|mut file| file.read_to_string(&mut armored)).map_err(io_error(input))?;

    let plaintext = decrypt_key_export(&armored, passphrase)?;
    let keys: Vec<ExportedRoomKey> = serde_json::from_slice(&plaintext)
        .map_err(|e| CliError::Json { path: input.to_path_buf(), reason: e.to_string() })?;
    let json = serde_json::to_vec_pretty(&keys)
        .map_err(|e| CliError::Json { path: output.to_path_buf(), reason: e.to_string() })?;
    std::fs::write(output, json).map_err(io_error(output))?;

    info!(sessions = keys.len(), output = %output.display(), "opened key export");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.bin");
        let cipher = dir.path().join("cipher.bin");
        let descriptor = dir.path().join("descriptor.json");
        let restored = dir.path().join("restored.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&plain, &data).unwrap();

        encrypt_attachment_file(&SystemEnv, &plain, &cipher, &descriptor).unwrap();
        assert_ne!(std::fs::read(&cipher).unwrap(), data);
        decrypt_attachment_file(&cipher, &restored, &descriptor).unwrap();

        assert_eq!(std::fs::read(&restored).unwrap(), data);
    }

    #[test]
    fn tampered_attachment_leaves_no_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.bin");
        let cipher = dir.path().join("cipher.bin");
        let descriptor = dir.path().join("descriptor.json");
        let restored = dir.path().join("restored.bin");
        std::fs::write(&plain, b"attack at dawn").unwrap();

        encrypt_attachment_file(&SystemEnv, &plain, &cipher, &descriptor).unwrap();
        let mut bytes = std::fs::read(&cipher).unwrap();
        bytes[0] ^= 1;
        std::fs::write(&cipher, bytes).unwrap();

        let err = decrypt_attachment_file(&cipher, &restored, &descriptor).unwrap_err();
        assert!(matches!(err, CliError::Attachment(AttachmentError::Integrity)));
        assert!(!restored.exists());
    }

    #[test]
    fn key_export_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let keys = dir.path().join("keys.json");
        let export = dir.path().join("keys.txt");
        let opened = dir.path().join("opened.json");
        let entries = vec![ExportedRoomKey {
            algorithm: "m.megolm.v1.aes-sha2".into(),
            room_id: olmstead_core::RoomId::new("!room:hs"),
            sender_key: "c2VuZGVy".into(),
            session_id: "c2Vzc2lvbg".into(),
            session_key: "a2V5".into(),
            sender_claimed_keys: Default::default(),
        }];
        std::fs::write(&keys, serde_json::to_vec(&entries).unwrap()).unwrap();

        encrypt_export_file(&SystemEnv, &keys, &export, "pw", 1_000).unwrap();
        assert!(matches!(
            decrypt_export_file(&export, &opened, "nope"),
            Err(CliError::KeyExport(KeyExportError::BadPassphrase))
        ));
        decrypt_export_file(&export, &opened, "pw").unwrap();

        let restored: Vec<ExportedRoomKey> = serde_json::from_slice(&std::fs::read(&opened).unwrap()).unwrap();
        assert_eq!(restored, entries);
    }
}
