mod common;

use chrono::Utc;
use common::{
    ENCRYPTION_KEY, ENCRYPTION_SALT, entry_text, manifest, memory_target, positions,
    segment_target, test_cipher, write_file,
};
use rawdata_core::{ENTRY_SEGMENT, MANIFEST_SEGMENT, ManifestEntry, RecordType};
use rawdata_migrate::log::read_segment_file;
use rawdata_migrate::{
    DatasetSpec, DelimitedDatasetWorker, LogClient, MemoryLogClient, MigrationWorker,
};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Two key fields, one payload column.
const DEDUP_SPEC: &str = r#"
metadata:
  source: kommune
  dataset: adresser
key:
  fields:
    - { name: id, type: long, column: Id }
    - { name: code, type: string, column: 1 }
  groupKeys: [id, code]
"#;

/// Every line is unique through the file name and line sequence.
const SEQUENCE_SPEC: &str = r#"
fileDescriptor:
  charset: ISO-8859-1
  delimiter: "|"
key:
  fields:
    - { name: filename, type: string, from: filename }
    - { name: line, type: long, from: sequence }
  groupKeys: [filename, line]
"#;

fn delimited_worker(
    spec: &str,
    input: &TempDir,
    store: &TempDir,
    target: rawdata_migrate::TargetConfig,
    client: Arc<dyn LogClient>,
) -> DelimitedDatasetWorker {
    let spec = DatasetSpec::from_yaml_str(spec).unwrap();
    DelimitedDatasetWorker::new(&spec, input.path(), store.path(), target, client).unwrap()
}

#[test]
fn repeated_key_keeps_last_record() {
    let input = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    write_file(input.path(), "adresser.csv", "id;code;value\n1;a;first\n1;a;second\n");

    let client = Arc::new(MemoryLogClient::new());
    let mut worker =
        delimited_worker(DEDUP_SPEC, &input, &store, memory_target("adresser"), client.clone());

    worker.prepare().unwrap();
    let stats = worker.produce().unwrap();
    worker.close().unwrap();

    assert_eq!(stats.records, 1);
    assert_eq!(stats.messages, 1);

    let messages = client.messages("adresser");
    assert_eq!(messages.len(), 1);
    assert_eq!(entry_text(&messages[0]), "Id;Code;Value\n1;a;second");

    let manifest = manifest(&messages[0]);
    assert_eq!(manifest.record_type, RecordType::Single);
    assert_eq!(manifest.source.as_deref(), Some("kommune"));
    assert_eq!(manifest.content_length, "Id;Code;Value\n1;a;second".len());
}

#[test]
fn sequence_keys_keep_every_line_in_file_order() {
    let input = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    // "ø" and "Å" in ISO-8859-1.
    write_file(input.path(), "b.txt", b"Navn|By\nKari|Bod\xf8\n".as_slice());
    write_file(
        input.path(),
        "a.txt",
        b"Navn|By\nOla|Oslo\nOla|Oslo\nPer|\xc5lesund\n".as_slice(),
    );

    let client = Arc::new(MemoryLogClient::new());
    let mut worker =
        delimited_worker(SEQUENCE_SPEC, &input, &store, memory_target("navn"), client.clone());

    worker.prepare().unwrap();
    let stats = worker.produce().unwrap();
    worker.close().unwrap();

    assert_eq!(stats.records, 4);
    assert_eq!(client.positions("navn"), positions(4));

    let lines: Vec<_> = client
        .messages("navn")
        .iter()
        .map(|m| entry_text(m).lines().nth(1).unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        lines,
        vec!["Ola|Oslo", "Ola|Oslo", "Per|Ålesund", "Kari|Bodø"]
    );

    let first = manifest(&client.messages("navn")[0]);
    assert_eq!(first.delimiter.as_deref(), Some("|"));
    assert_eq!(first.source_charset, "ISO-8859-1");
    assert_eq!(first.charset, "UTF-8");
}

#[test]
fn produce_from_prepared_store_without_source() {
    let input = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    write_file(input.path(), "adresser.csv", "id;code;value\n2;b;x\n1;a;y\n");

    let first_client = Arc::new(MemoryLogClient::new());
    let mut first =
        delimited_worker(DEDUP_SPEC, &input, &store, memory_target("adresser"), first_client);
    first.prepare().unwrap();
    first.close().unwrap();
    drop(first);

    // The source is gone; produce reads only the store.
    fs::remove_file(input.path().join("adresser.csv")).unwrap();

    let client = Arc::new(MemoryLogClient::new());
    let mut second =
        delimited_worker(DEDUP_SPEC, &input, &store, memory_target("adresser"), client.clone());
    second.produce().unwrap();
    second.close().unwrap();

    let entries: Vec<_> = client.messages("adresser").iter().map(entry_text).collect();
    assert_eq!(
        entries,
        vec!["Id;Code;Value\n1;a;y", "Id;Code;Value\n2;b;x"]
    );
}

#[test]
fn encrypted_segments_decrypt_to_published_content() {
    let input = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_file(input.path(), "adresser.csv", "id;code;value\n1;a;x\n1;b;y\n");

    let target = rawdata_migrate::TargetConfig {
        encryption_key: Some(ENCRYPTION_KEY.to_string()),
        encryption_salt: Some(ENCRYPTION_SALT.to_string()),
        ..segment_target("adresser", output.path())
    };
    let client = rawdata_migrate::open_client(&target).unwrap();
    let mut worker = delimited_worker(DEDUP_SPEC, &input, &store, target, client);

    worker.prepare().unwrap();
    let stats = worker.produce().unwrap();
    worker.close().unwrap();
    assert_eq!(stats.published, 2);

    let topic_dir = output.path().join("adresser");
    let mut files: Vec<_> = fs::read_dir(&topic_dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    let messages: Vec<_> = files
        .iter()
        .flat_map(|path| read_segment_file(path).unwrap())
        .collect();
    assert_eq!(messages.len(), 2);

    let cipher = test_cipher();
    for (message, expected) in messages.iter().zip(["1;a;x", "1;b;y"]) {
        let sealed_entry = message.segment(ENTRY_SEGMENT).unwrap();
        assert!(!sealed_entry.windows(expected.len()).any(|w| w == expected.as_bytes()));

        let entry = String::from_utf8(cipher.decrypt(sealed_entry).unwrap()).unwrap();
        assert_eq!(entry, format!("Id;Code;Value\n{expected}"));

        let manifest_bytes = cipher
            .decrypt(message.segment(MANIFEST_SEGMENT).unwrap())
            .unwrap();
        let manifest = ManifestEntry::from_json_bytes(&manifest_bytes).unwrap();
        assert_eq!(manifest.position, message.position);
        assert_eq!(manifest.content_length, entry.len());
    }
}

#[test]
fn unparseable_key_column_stops_prepare() {
    let input = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    write_file(input.path(), "adresser.csv", "id;code;value\nnot-a-number;a;x\n");

    let client = Arc::new(MemoryLogClient::new());
    let mut worker =
        delimited_worker(DEDUP_SPEC, &input, &store, memory_target("adresser"), client.clone());

    let err = worker.prepare().unwrap_err();
    assert!(matches!(err, rawdata_migrate::Error::MalformedSource(_)));
    worker.close().unwrap();
    assert!(client.positions("adresser").is_empty());
}

#[test]
fn created_date_is_stamped_when_messages_are_produced() {
    let input = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    write_file(input.path(), "adresser.csv", "id;code;value\n1;a;x\n2;b;y\n");

    let client = Arc::new(MemoryLogClient::new());
    let mut worker =
        delimited_worker(DEDUP_SPEC, &input, &store, memory_target("adresser"), client.clone());
    worker.prepare().unwrap();

    thread::sleep(Duration::from_millis(50));
    let produce_started = Utc::now();
    worker.produce().unwrap();
    worker.close().unwrap();

    for message in client.messages("adresser") {
        assert!(manifest(&message).created_date >= produce_started);
    }
}
