#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use thumbservice_config::{ConversionConfig, ConversionRule, ThumbnailSize};
use thumbservice_core::{
    ConversionError, ConverterRouter, ExternalConverter, SourceImage,
    ThumbnailConverter,
};
use tokio_util::sync::CancellationToken;

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
/// Writes the PNG signature followed by the input bytes.
const COPY_AS_PNG: &str =
    "printf '\\211PNG\\r\\n\\032\\n' > \"$2\"\ncat \"$1\" >> \"$2\"\n";

/// Scripts run through `/bin/sh` so the test never executes a file it has
/// just written.
fn converter(
    dir: &TempDir,
    body: &str,
    extra_args: &[&str],
) -> ExternalConverter {
    let script = write_script(dir.path(), "convert.sh", body);
    let mut arguments = script_arguments(&script);
    arguments.extend(extra_args.iter().map(|arg| arg.to_string()));
    ExternalConverter::new(&conversion_config(arguments))
}

fn conversion_config(arguments: Vec<String>) -> ConversionConfig {
    ConversionConfig {
        executable: PathBuf::from("/bin/sh"),
        arguments,
        timeout: Duration::from_secs(10),
        thumbnail_size: ThumbnailSize {
            width: 64,
            height: 48,
        },
        rules: Vec::new(),
    }
}

fn script_arguments(script: &Path) -> Vec<String> {
    vec![
        script.to_string_lossy().into_owned(),
        "$FILEIN".to_string(),
        "$FILEOUT".to_string(),
    ]
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn source() -> SourceImage {
    SourceImage::new("hero.psd", b"layers".to_vec())
}

#[tokio::test]
async fn returns_the_bytes_the_tool_wrote() {
    let dir = tempfile::tempdir().unwrap();
    let conv = converter(&dir, COPY_AS_PNG, &[]);

    let bytes = conv.convert(&source()).await.unwrap();

    assert!(bytes.starts_with(PNG_MAGIC));
    assert!(bytes.ends_with(b"layers"));
}

#[tokio::test]
async fn input_keeps_the_source_file_name_and_size_is_substituted() {
    let dir = tempfile::tempdir().unwrap();
    let body = format!(
        "case \"$1\" in *hero.psd) ;; *) exit 9 ;; esac\n\
         {COPY_AS_PNG}printf '%s' \"$3\" >> \"$2\"\n"
    );
    let conv = converter(&dir, &body, &["$WIDTHx$HEIGHT"]);

    let bytes = conv.convert(&source()).await.unwrap();

    assert!(bytes.ends_with(b"layers64x48"));
}

#[tokio::test]
async fn non_zero_exit_carries_code_and_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let conv =
        converter(&dir, "echo 'no decode delegate' >&2\nexit 3\n", &[]);

    let err = conv.convert(&source()).await.unwrap_err();

    match err {
        ConversionError::ExecutionFailed { exit_code, stderr } => {
            assert_eq!(exit_code, Some(3));
            assert_eq!(stderr, "no decode delegate");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn missing_empty_or_unrecognizable_output_fails() {
    let dir = tempfile::tempdir().unwrap();
    for body in ["exit 0\n", ": > \"$2\"\n", "echo hello > \"$2\"\n"] {
        let conv = converter(&dir, body, &[]);
        let err = conv.convert(&source()).await.unwrap_err();
        assert!(
            matches!(
                err,
                ConversionError::ExecutionFailed {
                    exit_code: Some(0),
                    ..
                }
            ),
            "{body:?} gave {err:?}"
        );
    }
}

#[tokio::test]
async fn slow_tools_time_out() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "convert.sh", "exec sleep 5\n");
    let conv = ExternalConverter::new(&ConversionConfig {
        timeout: Duration::from_millis(200),
        ..conversion_config(script_arguments(&script))
    });

    let started = std::time::Instant::now();
    let err = conv.convert(&source()).await.unwrap_err();

    assert!(matches!(err, ConversionError::Timeout(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn abort_kills_the_running_tool() {
    let dir = tempfile::tempdir().unwrap();
    let abort = CancellationToken::new();
    let conv =
        converter(&dir, "exec sleep 5\n", &[]).with_abort(abort.clone());
    let src = source();

    let canceller = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        abort.cancel();
    };
    let started = std::time::Instant::now();
    let (result, ()) = tokio::join!(conv.convert(&src), canceller);

    assert!(matches!(result, Err(ConversionError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn entries_route_by_extension_and_name_the_output() {
    let dir = tempfile::tempdir().unwrap();
    let fallback = write_script(dir.path(), "fallback.sh", "exit 7\n");
    // Only accepts a request for a .jpg output file.
    let layered = write_script(
        dir.path(),
        "layered.sh",
        &format!(
            "case \"$2\" in *thumbnail.jpg) ;; *) exit 8 ;; esac\n\
             {COPY_AS_PNG}"
        ),
    );
    let mut config = conversion_config(script_arguments(&fallback));
    config.rules = vec![ConversionRule {
        extensions: vec!["psd".into()],
        executable: PathBuf::from("/bin/sh"),
        arguments: script_arguments(&layered),
        convert_to_png: false,
        thumbnail_extension: Some("jpg".into()),
    }];
    let router = ConverterRouter::from_config(&config);

    let bytes = router.convert(&source()).await.unwrap();
    assert!(bytes.starts_with(PNG_MAGIC));
    assert!(bytes.ends_with(b"layers"));

    let other = SourceImage::new("cover.png", b"flat".to_vec());
    let err = router.convert(&other).await.unwrap_err();
    assert!(matches!(
        err,
        ConversionError::ExecutionFailed {
            exit_code: Some(7),
            ..
        }
    ));
}
