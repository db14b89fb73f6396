#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thumbservice_config::{ConnectionConfig, FinalChange};
use thumbservice_core::{AdapterError, P4CommandClient, RepositoryClient};

/// Stand-in for the `p4` client. Keeps the counter and every attribute
/// call as files next to the script.
const FAKE_P4: &str = r#"#!/bin/sh
state="$(dirname "$0")"
echo "$*" >> "$state/calls"
while [ $# -gt 0 ]; do
  case "$1" in
    -p|-u|-c) shift 2 ;;
    -ztag) shift ;;
    *) break ;;
  esac
done
cmd="$1"
shift
for last; do :; done
case "$cmd" in
  info)
    printf '... userName thumbs\n... clientName art-ws\n\n'
    ;;
  counter)
    if [ $# -ge 2 ]; then
      echo "$2" > "$state/counter"
    elif [ -f "$state/counter" ]; then
      cat "$state/counter"
    else
      echo 0
    fi
    ;;
  changes)
    for change in 12 11 3; do
      printf '... change %s\n... status submitted\n\n' "$change"
    done
    ;;
  fstat)
    case "$last" in
      *@=12)
        printf '... depotFile //art-ws/hero.png\n... headRev 2\n'
        printf '... headType binary+F\n... headAction edit\n'
        printf '... fileSize 2048\n\n'
        printf '... depotFile //art-ws/old.png\n... headRev 5\n'
        printf '... headType binary\n... headAction delete\n\n'
        ;;
      *@=11)
        printf '... depotFile //art-ws/hero.png\n... headRev 1\n'
        printf '... headType binary+F\n... headAction add\n'
        printf '... fileSize 1024\n\n'
        ;;
      *hero.png#2)
        printf '... depotFile //art-ws/hero.png\n... headRev 2\n'
        printf '... attr-thumb 0CC175B9C0F1B6A831C399E269772661\n\n'
        ;;
      *hero.png#1)
        printf '... depotFile //art-ws/hero.png\n... headRev 1\n\n'
        ;;
      *) echo "$last - no such file(s)." >&2 ;;
    esac
    ;;
  print)
    case "$last" in
      *#99) echo "$last - no such file(s)." >&2 ;;
      *) printf 'content of %s' "$last" ;;
    esac
    ;;
  attribute)
    echo "$*" >> "$state/attributes"
    ;;
  *)
    echo "unknown command $cmd" >&2
    exit 1
    ;;
esac
"#;

fn install_fake_p4(dir: &Path) -> PathBuf {
    let path = dir.join("p4");
    fs::write(&path, FAKE_P4).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn client(
    p4: &Path,
    first_change: Option<u64>,
    final_change: Option<FinalChange>,
) -> P4CommandClient {
    P4CommandClient::new(&ConnectionConfig {
        client: "art-ws".into(),
        port: Some("localhost:1666".into()),
        user: Some("thumbs".into()),
        p4_executable: p4.to_path_buf(),
        first_change,
        final_change,
    })
}

// One test so the script is never written while another test forks.
#[tokio::test]
async fn drives_the_p4_command_line() {
    let dir = tempfile::tempdir().unwrap();
    let p4 = install_fake_p4(dir.path());
    let state = |name: &str| {
        fs::read_to_string(dir.path().join(name)).unwrap_or_default()
    };

    // Connection check passes global options first.
    let repo = client(&p4, Some(5), None);
    repo.connect().await.unwrap();
    assert!(
        state("calls")
            .lines()
            .next()
            .unwrap()
            .starts_with("-p localhost:1666 -u thumbs -c art-ws -ztag info")
    );

    // Listing starts at firstChange, skips deletes, advances the counter.
    let events = repo.changes_since().await.unwrap();
    let listed: Vec<_> = events
        .iter()
        .map(|e| (e.change, e.path.as_str(), e.revision, e.size))
        .collect();
    assert_eq!(
        listed,
        vec![
            (11, "//art-ws/hero.png", 1, 1024),
            (12, "//art-ws/hero.png", 2, 2048)
        ]
    );
    assert_eq!(events[1].file_type, "binary+F");
    assert_eq!(state("counter").trim(), "13");
    assert!(repo.changes_since().await.unwrap().is_empty());
    assert!(!repo.is_exhausted());

    // Content and attributes address a single revision.
    let content = repo.fetch_content("//art-ws/hero.png", 2).await.unwrap();
    assert_eq!(content, b"content of //art-ws/hero.png#2");
    assert!(matches!(
        repo.fetch_content("//art-ws/hero.png", 99).await,
        Err(AdapterError::StaleRevision { revision: 99, .. })
    ));
    let digest = "0CC175B9C0F1B6A831C399E269772661";
    repo.write_attribute("//art-ws/hero.png", 2, "thumb", digest)
        .await
        .unwrap();
    assert!(state("attributes").contains(&format!(
        "-f -n thumb -v {digest} //art-ws/hero.png#2"
    )));
    let current = repo.read_attribute("//art-ws/hero.png", 2, "thumb").await;
    assert_eq!(current.unwrap().as_deref(), Some(digest));
    let unset = repo.read_attribute("//art-ws/hero.png", 1, "thumb").await;
    assert_eq!(unset.unwrap(), None);
    assert!(matches!(
        repo.read_attribute("//art-ws/hero.png", 99, "thumb").await,
        Err(AdapterError::StaleRevision { revision: 99, .. })
    ));
    repo.clear_attribute("//art-ws/hero.png", 2, "thumb")
        .await
        .unwrap();
    assert!(
        state("attributes")
            .lines()
            .any(|line| line == "-f -n thumb //art-ws/hero.png#2")
    );

    // firstChange wins over a counter that is further along.
    assert_eq!(state("counter").trim(), "13");
    let replay = client(&p4, Some(5), None);
    let changes: Vec<u64> = replay
        .changes_since()
        .await
        .unwrap()
        .iter()
        .map(|e| e.change)
        .collect();
    assert_eq!(changes, vec![11, 12]);

    // A restarted adapter resumes from the counter.
    let resumed = client(&p4, None, Some(FinalChange::Change(20)));
    assert!(resumed.changes_since().await.unwrap().is_empty());
    assert!(!resumed.is_exhausted());

    let bounded = client(&p4, None, Some(FinalChange::Change(12)));
    assert!(bounded.changes_since().await.unwrap().is_empty());
    assert!(bounded.is_exhausted());

    // -1 bounds the range by the head change seen at the first listing.
    let at_head = client(&p4, None, Some(FinalChange::Head));
    assert!(at_head.changes_since().await.unwrap().is_empty());
    assert!(at_head.is_exhausted());
    assert!(
        state("calls")
            .contains("-ztag changes -m 1 -s submitted //art-ws/...")
    );

    let up_to_head = client(&p4, Some(11), Some(FinalChange::Head));
    assert_eq!(up_to_head.changes_since().await.unwrap().len(), 2);
    assert!(up_to_head.is_exhausted());
}
