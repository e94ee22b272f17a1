use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};

use chelsa_download::digest::{self, Freshness, StaleReason};
use chelsa_download::domain::{Kind, Variable};
use chelsa_download::manifest::{
    ListMetadata, ListingSource, Manifest, ManifestBuilder, RemoteRecord, load_listing,
};
use chelsa_download::store::Store;

fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let store = Store::new_with_paths(root.join("lists"), root.join("cache"));
    (dir, store)
}

fn json_source(path: &str) -> ListingSource {
    ListingSource::Json {
        path: path.to_string(),
    }
}

fn trace_records() -> Vec<RemoteRecord> {
    vec![
        RemoteRecord::file("bio01/CHELSA_TraCE21k_bio01_100_V1.0.tif", 300),
        RemoteRecord::file("bio01/CHELSA_TraCE21k_bio01_50_V1.0.tif", 100),
        RemoteRecord::file("bio01/CHELSA_TraCE21k_bio01_75_V1.0.tif", 200),
    ]
}

#[test]
fn trace_entries_sorted_by_time_with_range() {
    let (_dir, store) = temp_store();
    let report = ManifestBuilder::new(&store)
        .build(Kind::Trace, trace_records(), json_source("listing.json"))
        .unwrap();

    assert_eq!(report.lists.len(), 1);
    let list = &report.lists[0];
    assert_eq!(list.variable.as_str(), "bio01");
    assert_eq!((list.time_min, list.time_max), (Some(50), Some(100)));

    let lines = Store::read_list(&list.list_path).unwrap();
    assert_eq!(
        lines,
        vec![
            "bio01/CHELSA_TraCE21k_bio01_50_V1.0.tif",
            "bio01/CHELSA_TraCE21k_bio01_75_V1.0.tif",
            "bio01/CHELSA_TraCE21k_bio01_100_V1.0.tif",
        ]
    );

    let metadata = ListMetadata::read(&list.metadata_path).unwrap();
    assert_eq!(metadata.count, 3);
    assert_eq!(metadata.total_size_bytes, 600);
    assert_eq!(metadata.time_min, Some(50));
    assert_eq!(metadata.time_max, Some(100));
    assert_eq!(metadata.digest_algorithm, digest::DIGEST_ALGORITHM);
}

#[test]
fn rebuilding_is_byte_identical() {
    let (_dir, store) = temp_store();
    let builder = ManifestBuilder::new(&store);

    let first = builder
        .build(Kind::Trace, trace_records(), json_source("listing.json"))
        .unwrap();
    let first_bytes = fs::read(&first.lists[0].list_path).unwrap();

    let mut reversed = trace_records();
    reversed.reverse();
    let second = builder
        .build(Kind::Trace, reversed, json_source("listing.json"))
        .unwrap();
    let second_bytes = fs::read(&second.lists[0].list_path).unwrap();

    assert_eq!(first_bytes, second_bytes);
    assert_eq!(first.lists[0].digest, second.lists[0].digest);
    assert_eq!(first.lists[0].digest, digest::digest_bytes(&second_bytes));
}

#[test]
fn single_byte_change_makes_list_stale() {
    let (_dir, store) = temp_store();
    let report = ManifestBuilder::new(&store)
        .build(Kind::Trace, trace_records(), json_source("listing.json"))
        .unwrap();
    let list_path = &report.lists[0].list_path;
    let metadata = ListMetadata::read(&report.lists[0].metadata_path).unwrap();
    assert_eq!(digest::validate(list_path, &metadata).unwrap(), Freshness::Fresh);

    let mut bytes = fs::read(list_path).unwrap();
    bytes[0] = b'x';
    fs::write(list_path, &bytes).unwrap();

    assert_matches!(
        digest::validate(list_path, &metadata).unwrap(),
        Freshness::Stale(StaleReason::DigestMismatch { .. })
    );
    let manifest = Manifest::load(Kind::Trace, list_path).unwrap();
    assert!(!manifest.freshness.is_fresh());
}

#[test]
fn removed_line_is_a_count_mismatch() {
    let (_dir, store) = temp_store();
    let report = ManifestBuilder::new(&store)
        .build(Kind::Trace, trace_records(), json_source("listing.json"))
        .unwrap();
    let list_path = &report.lists[0].list_path;
    let metadata = ListMetadata::read(&report.lists[0].metadata_path).unwrap();

    let content = fs::read_to_string(list_path).unwrap();
    let trimmed: String = content.lines().skip(1).map(|line| format!("{line}\n")).collect();
    fs::write(list_path, trimmed).unwrap();

    assert_eq!(
        digest::validate(list_path, &metadata).unwrap(),
        Freshness::Stale(StaleReason::CountMismatch {
            recorded: 3,
            actual: 2
        })
    );
}

#[test]
fn present_lists_grouped_per_variable() {
    let (_dir, store) = temp_store();
    let records = vec![
        RemoteRecord::file("climatologies/1981-2010/bio/CHELSA_bio12_1981-2010_V.2.1.tif", 10),
        RemoteRecord::file("climatologies/1981-2010/bio/CHELSA_bio1_1981-2010_V.2.1.tif", 20),
        RemoteRecord::file(
            "climatologies/2041-2070/GFDL-ESM4/ssp126/bio/CHELSA_bio1_2041-2070_gfdl-esm4_ssp126_V.2.1.tif",
            30,
        ),
        RemoteRecord::file("climatologies/1981-2010/bio/CHELSA_gdd5_1981-2010_V.2.1.tif.aux", 1),
    ];
    let report = ManifestBuilder::new(&store)
        .build(
            Kind::Present,
            records,
            ListingSource::Remote {
                root: "chelsa02_bioclim:".to_string(),
            },
        )
        .unwrap();

    let variables: Vec<&str> = report
        .lists
        .iter()
        .map(|list| list.variable.as_str())
        .collect();
    assert_eq!(variables, vec!["bio01", "bio12"]);
    assert_eq!(report.unparsed, 1);
    assert_eq!(report.unparsed_samples.len(), 1);

    let bio01: Variable = "bio1".parse().unwrap();
    let list_path = store.list_path(Kind::Present, &bio01);
    assert_eq!(report.lists[0].list_path, list_path);
    let manifest = Manifest::load(Kind::Present, &list_path).unwrap();
    assert_eq!(manifest.entries.len(), 2);
    assert_eq!(manifest.entries[0].size, Some(20));
    assert!(manifest.freshness.is_fresh());
    assert_eq!(manifest.metadata.ka_bp, None);
}

#[test]
fn listing_document_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8Path::from_path(dir.path()).unwrap().join("chelsatrace_filelist.json");
    fs::write(
        &path,
        r#"[
            {"Path":"bio01","Name":"bio01","Size":-1,"IsDir":true},
            {"Path":"bio01/CHELSA_TraCE21k_bio01_-10_V1.0.tif","Size":5,"ModTime":"2021-05-01T10:00:00Z","IsDir":false}
        ]"#,
    )
    .unwrap();

    let records = load_listing(&path).unwrap();
    assert_eq!(records.len(), 2);

    let (_store_dir, store) = temp_store();
    let report = ManifestBuilder::new(&store)
        .build(Kind::Trace, records, json_source(path.as_str()))
        .unwrap();
    assert_eq!(report.directories, 1);
    assert_eq!(report.unparsed, 0);
    assert_eq!(report.lists[0].count, 1);
}

#[test]
fn same_file_name_in_two_directories_is_collapsed() {
    let (_dir, store) = temp_store();
    let records = vec![
        RemoteRecord::file("mirror/bio/CHELSA_bio1_1981-2010_V.2.1.tif", 20),
        RemoteRecord::file("GLOBAL/climatologies/1981-2010/bio/CHELSA_bio1_1981-2010_V.2.1.tif", 20),
        RemoteRecord::file("GLOBAL/climatologies/1981-2010/bio/CHELSA_bio12_1981-2010_V.2.1.tif", 10),
    ];
    let report = ManifestBuilder::new(&store)
        .build(Kind::Present, records, json_source("listing.json"))
        .unwrap();

    assert_eq!(report.name_collisions, 1);
    assert_eq!(report.duplicates, 0);
    assert_eq!(report.lists[0].variable.as_str(), "bio01");
    assert_eq!(report.lists[0].count, 1);
    assert_eq!(
        Store::read_list(&report.lists[0].list_path).unwrap(),
        vec!["GLOBAL/climatologies/1981-2010/bio/CHELSA_bio1_1981-2010_V.2.1.tif"]
    );
    let metadata = ListMetadata::read(&report.lists[0].metadata_path).unwrap();
    assert_eq!(metadata.count, 1);
    assert_eq!(metadata.total_size_bytes, 20);
}
