// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod util;

use std::{thread, time::Duration};

use assert_matches::assert_matches;
use tempfile::TempDir;

use libstord::{
    engine::{
        AccessMode, CancelToken, DevicePosition, FaultConfig, FileRange, Selection, SessionId,
        VolumeCatalog, VolumeStatus, WriteRequest,
    },
    stord::{ErrorEnum, StordError},
};

use util::{
    autoloader, daemon, disk, records, small_disk, tape, test_config, volume, BLOCK_RECORD,
};

fn request(device: &str) -> WriteRequest {
    WriteRequest {
        job: "nightly".to_owned(),
        device: device.to_owned(),
        volume: None,
    }
}

#[test]
fn test_disk_round_trip() {
    let dir = TempDir::new().unwrap();
    let daemon = daemon(
        test_config(dir.path()),
        vec![disk("disk0", &dir.path().join("media"))],
        &["Disk-0001"],
    );
    let cancel = CancelToken::new();
    let written = records(40, 300);

    let result = daemon
        .write_session(&request("disk0"), written.clone(), &cancel)
        .unwrap();
    assert_eq!(result.records, 40);
    assert_eq!(result.bytes, 40 * 300);
    assert_eq!(result.files, 14);
    assert!(!result.spooled);
    assert_eq!(result.volumes.len(), 1);
    assert_eq!(result.volumes[0].volume, volume("Disk-0001"));
    assert_eq!(result.volumes[0].start, DevicePosition::new(0, 1));
    assert_eq!(result.volumes[0].first_index, 1);
    assert_eq!(result.volumes[0].last_index, 14);

    let (read, back) = daemon
        .sessions()
        .read_records("disk0", &volume("Disk-0001"), result.volumes[0].start, &cancel)
        .unwrap();
    assert_eq!(back, written);
    assert!(read.complete);
    assert_eq!(read.session_id, result.session_id);
    assert_eq!(read.job, "nightly");
    assert_eq!(read.volumes, vec![volume("Disk-0001")]);

    let record = daemon.catalog().volume(&volume("Disk-0001")).unwrap().unwrap();
    assert_eq!(record.status, VolumeStatus::Append);
    assert_eq!(record.sessions, 1);
}

#[test]
/// A second session appends after the first; each reads back alone.
fn test_tape_append_sessions() {
    let dir = TempDir::new().unwrap();
    let daemon = daemon(test_config(dir.path()), vec![tape("tape0")], &["Tape-0001"]);
    let cancel = CancelToken::new();

    let first_records = records(10, 2500);
    let second_records = records(7, 100);
    let first = daemon
        .write_session(&request("LTO"), first_records.clone(), &cancel)
        .unwrap();
    let second = daemon
        .write_session(&request("tape0"), second_records.clone(), &cancel)
        .unwrap();
    assert_ne!(first.session_id, second.session_id);
    assert!(second.volumes[0].start > first.volumes[0].end);

    let media = daemon.sessions().session_media(second.session_id).unwrap();
    assert_eq!(media, vec![(volume("Tape-0001"), second.volumes[0].start)]);

    let (_, back) = daemon
        .sessions()
        .read_records("tape0", &volume("Tape-0001"), first.volumes[0].start, &cancel)
        .unwrap();
    assert_eq!(back, first_records);
    let (_, back) = daemon
        .sessions()
        .read_records("tape0", &volume("Tape-0001"), second.volumes[0].start, &cancel)
        .unwrap();
    assert_eq!(back, second_records);

    let record = daemon.catalog().volume(&volume("Tape-0001")).unwrap().unwrap();
    assert_eq!(record.sessions, 2);
}

#[test]
fn test_wrong_volume_label() {
    let dir = TempDir::new().unwrap();
    let daemon = daemon(test_config(dir.path()), vec![tape("tape0")], &["Tape-0001"]);
    let cancel = CancelToken::new();
    daemon
        .write_session(&request("tape0"), records(2, 10), &cancel)
        .unwrap();

    let mut wrong = request("tape0");
    wrong.volume = Some(volume("Tape-0002"));
    let err = daemon.write_session(&wrong, records(2, 10), &cancel).unwrap_err();
    assert_eq!(err.kind(), ErrorEnum::NoSuchVolume);

    // The device was given back.
    assert!(daemon
        .sessions()
        .pool()
        .try_reserve("tape0", AccessMode::Write, "next")
        .is_ok());
}

#[test]
/// Records filling exactly one block each run out of room on the first
/// volume and continue on the second.
fn test_span_volumes() {
    let dir = TempDir::new().unwrap();
    let faults = FaultConfig {
        eom_after_blocks: Some(10),
        ..FaultConfig::default()
    };
    let daemon = daemon(
        test_config(dir.path()),
        vec![autoloader("loader0", &["Vol-A", "Vol-B"], Some(faults))],
        &["Vol-A", "Vol-B"],
    );
    let cancel = CancelToken::new();
    let written = records(15, BLOCK_RECORD);

    let result = daemon
        .write_session(&request("loader0"), written.clone(), &cancel)
        .unwrap();
    let names: Vec<_> = result.volumes.iter().map(|span| span.volume.clone()).collect();
    assert_eq!(names, vec![volume("Vol-A"), volume("Vol-B")]);
    assert_eq!(result.blocks, 15);

    let catalog = daemon.catalog();
    assert_eq!(
        catalog.volume(&volume("Vol-A")).unwrap().unwrap().status,
        VolumeStatus::Full
    );
    assert_eq!(
        catalog.volume(&volume("Vol-B")).unwrap().unwrap().status,
        VolumeStatus::Append
    );
    let media = catalog.job_media(result.session_id).unwrap();
    assert_eq!(media.len(), 2);
    assert_eq!(media[1].volume_index, 2);
    assert_eq!(media[0].first_index, 1);
    assert_eq!(media[1].first_index, media[0].last_index);
    assert_eq!(media[1].last_index, 5);

    let (read, back) = daemon
        .sessions()
        .read_records("loader0", &volume("Vol-A"), result.volumes[0].start, &cancel)
        .unwrap();
    assert_eq!(back, written);
    assert!(read.complete);
    assert_eq!(read.volumes, vec![volume("Vol-A"), volume("Vol-B")]);
}

#[test]
/// A record split over the end of a volume is joined up on reading.
fn test_span_volumes_split_record() {
    let dir = TempDir::new().unwrap();
    let faults = FaultConfig {
        eom_after_blocks: Some(10),
        ..FaultConfig::default()
    };
    let daemon = daemon(
        test_config(dir.path()),
        vec![autoloader("loader0", &["Vol-A", "Vol-B"], Some(faults))],
        &["Vol-A", "Vol-B"],
    );
    let cancel = CancelToken::new();
    let written = records(6, 2000);

    let result = daemon
        .write_session(&request("loader0"), written.clone(), &cancel)
        .unwrap();
    assert_eq!(result.volumes.len(), 2);

    let (first, start) = daemon
        .sessions()
        .session_media(result.session_id)
        .unwrap()
        .remove(0);
    let (read, back) = daemon
        .sessions()
        .read_records("loader0", &first, start, &cancel)
        .unwrap();
    assert_eq!(back, written);
    assert_eq!(read.bytes, 6 * 2000);
}

#[test]
/// With no volume left, the session fails but what reached the first
/// volume can still be read.
fn test_out_of_media() {
    let dir = TempDir::new().unwrap();
    let faults = FaultConfig {
        eom_after_blocks: Some(10),
        ..FaultConfig::default()
    };
    let daemon = daemon(
        test_config(dir.path()),
        vec![autoloader("loader0", &["Vol-A"], Some(faults))],
        &["Vol-A"],
    );
    let cancel = CancelToken::new();
    let written = records(15, BLOCK_RECORD);

    let err = daemon
        .write_session(&request("loader0"), written.clone(), &cancel)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorEnum::OutOfMedia);
    assert_matches!(err, StordError::Positioned { ref volume, .. } if volume == "Vol-A");

    assert_eq!(
        daemon.catalog().volume(&volume("Vol-A")).unwrap().unwrap().status,
        VolumeStatus::Full
    );

    let media = daemon.sessions().session_media(SessionId(1)).unwrap();
    assert_eq!(media.len(), 1);
    let (read, back) = daemon
        .sessions()
        .read_records("loader0", &media[0].0, media[0].1, &cancel)
        .unwrap();
    assert!(!read.complete);
    assert_eq!(back, written[..8].to_vec());
}

#[test]
fn test_write_retries() {
    let dir = TempDir::new().unwrap();
    let faults = FaultConfig {
        failing_writes: 2,
        ..FaultConfig::default()
    };
    let daemon = daemon(
        test_config(dir.path()),
        vec![autoloader("loader0", &["Vol-A"], Some(faults))],
        &["Vol-A"],
    );
    let cancel = CancelToken::new();
    let written = records(5, 700);

    let result = daemon
        .write_session(&request("loader0"), written.clone(), &cancel)
        .unwrap();
    let (_, back) = daemon
        .sessions()
        .read_records("loader0", &volume("Vol-A"), result.volumes[0].start, &cancel)
        .unwrap();
    assert_eq!(back, written);
}

#[test]
fn test_write_retries_exhausted() {
    let dir = TempDir::new().unwrap();
    let faults = FaultConfig {
        failing_writes: 100,
        ..FaultConfig::default()
    };
    let daemon = daemon(
        test_config(dir.path()),
        vec![autoloader("loader0", &["Vol-A"], Some(faults))],
        &["Vol-A"],
    );
    let cancel = CancelToken::new();

    let err = daemon
        .write_session(&request("loader0"), records(5, 700), &cancel)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorEnum::MediaError);
    assert_eq!(daemon.status().unwrap().devices[0].owner, None);
}

#[test]
fn test_spool_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.spool_data = true;
    let daemon = daemon(
        config,
        vec![disk("disk0", &dir.path().join("media"))],
        &["Disk-0001"],
    );
    let cancel = CancelToken::new();
    let written = records(30, 900);

    let result = daemon
        .write_session(&request("disk0"), written.clone(), &cancel)
        .unwrap();
    assert!(result.spooled);
    assert_eq!(daemon.context().spool_bytes(), 0);

    let (_, back) = daemon
        .sessions()
        .read_records("disk0", &volume("Disk-0001"), result.volumes[0].start, &cancel)
        .unwrap();
    assert_eq!(back, written);
}

#[test]
/// Once the job's spool limit is hit the spooled part is written out and
/// the rest of the session goes straight to the device.
fn test_spool_full_fallback() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.spool_data = true;
    config.max_job_spool_size = Some(3 * (4 + 1040));
    let daemon = daemon(
        config,
        vec![disk("disk0", &dir.path().join("media"))],
        &["Disk-0001"],
    );
    let cancel = CancelToken::new();
    let written = records(15, BLOCK_RECORD);

    let result = daemon
        .write_session(&request("disk0"), written.clone(), &cancel)
        .unwrap();
    assert!(result.spooled);
    assert_eq!(result.records, 15);
    assert_eq!(daemon.context().spool_bytes(), 0);

    let (_, back) = daemon
        .sessions()
        .read_records("disk0", &volume("Disk-0001"), result.volumes[0].start, &cancel)
        .unwrap();
    assert_eq!(back, written);
}

#[test]
/// Spooled data is written out onto a second volume when the first one
/// fills up while despooling.
fn test_spool_span_volumes() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.spool_data = true;
    let faults = FaultConfig {
        eom_after_blocks: Some(10),
        ..FaultConfig::default()
    };
    let daemon = daemon(
        config,
        vec![autoloader("loader0", &["Vol-A", "Vol-B"], Some(faults))],
        &["Vol-A", "Vol-B"],
    );
    let cancel = CancelToken::new();
    let written = records(15, BLOCK_RECORD);

    let result = daemon
        .write_session(&request("loader0"), written.clone(), &cancel)
        .unwrap();
    assert!(result.spooled);
    assert_eq!(daemon.context().spool_bytes(), 0);
    let names: Vec<_> = result.volumes.iter().map(|span| span.volume.clone()).collect();
    assert_eq!(names, vec![volume("Vol-A"), volume("Vol-B")]);

    let (read, back) = daemon
        .sessions()
        .read_records("loader0", &volume("Vol-A"), result.volumes[0].start, &cancel)
        .unwrap();
    assert_eq!(back, written);
    assert!(read.complete);
    assert_eq!(read.volumes, vec![volume("Vol-A"), volume("Vol-B")]);
}

#[test]
/// A hung transfer is abandoned when the session is cancelled and the
/// device is left marked for recovery.
fn test_cancel_hung_device() {
    let dir = TempDir::new().unwrap();
    let faults = FaultConfig {
        hang_after_blocks: Some(5),
        ..FaultConfig::default()
    };
    let daemon = daemon(
        test_config(dir.path()),
        vec![autoloader("loader0", &["Vol-A"], Some(faults))],
        &["Vol-A"],
    );
    let cancel = CancelToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        })
    };

    let err = daemon
        .write_session(&request("loader0"), records(10, BLOCK_RECORD), &cancel)
        .unwrap_err();
    canceller.join().unwrap();
    assert_eq!(err.kind(), ErrorEnum::Cancelled);

    let status = daemon.status().unwrap();
    assert!(status.devices[0].needs_recovery);
    assert_eq!(status.devices[0].owner, None);
}

#[test]
fn test_label_volume() {
    let dir = TempDir::new().unwrap();
    let daemon = daemon(
        test_config(dir.path()),
        vec![disk("disk0", &dir.path().join("media"))],
        &[],
    );
    let cancel = CancelToken::new();

    let label = daemon
        .label_volume("disk0", &volume("Disk-0009"), &cancel)
        .unwrap();
    assert_eq!(label.volume, volume("Disk-0009"));
    assert_eq!(label.sequence, 1);
    assert_eq!(daemon.changer().volumes().unwrap(), vec![volume("Disk-0009")]);

    let err = daemon
        .label_volume("disk0", &volume("Disk-0009"), &cancel)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorEnum::Invalid);

    let result = daemon
        .write_session(&request("disk0"), records(3, 50), &cancel)
        .unwrap();
    assert_eq!(result.volumes[0].volume, volume("Disk-0009"));
    assert_eq!(result.volumes[0].start, DevicePosition::new(0, 1));
    assert!(dir.path().join("catalog.json").exists());
}

#[test]
/// A daemon started on an existing working directory hands out session
/// ids after the ones its catalog already knows.
fn test_session_ids_continue_across_runs() {
    let dir = TempDir::new().unwrap();
    let media = dir.path().join("media");
    let cancel = CancelToken::new();

    let first = daemon(
        test_config(dir.path()),
        vec![disk("disk0", &media)],
        &["Disk-0001"],
    );
    let one = first
        .write_session(&request("disk0"), records(3, 100), &cancel)
        .unwrap();
    first.shutdown().unwrap();

    let second = daemon(
        test_config(dir.path()),
        vec![disk("disk0", &media)],
        &["Disk-0001"],
    );
    let two = second
        .write_session(&request("disk0"), records(3, 100), &cancel)
        .unwrap();
    assert_eq!(one.session_id, SessionId(1));
    assert_eq!(two.session_id, SessionId(2));
}

#[test]
/// Two daemons with their own catalogs both number their first session 1.
/// A session continued onto a volume that already holds the other
/// daemon's session 1 is still followed to its own continuation.
fn test_same_session_id_other_run() {
    let media = TempDir::new().unwrap();
    let dir1 = TempDir::new().unwrap();
    let dir2 = TempDir::new().unwrap();
    let cancel = CancelToken::new();

    let first = daemon(
        test_config(dir1.path()),
        vec![disk("disk0", media.path())],
        &["Disk-B"],
    );
    let earlier = records(3, 100);
    let one = first
        .write_session(&request("disk0"), earlier.clone(), &cancel)
        .unwrap();
    first.shutdown().unwrap();

    let second = daemon(
        test_config(dir2.path()),
        vec![small_disk("disk0", media.path(), 10)],
        &["Disk-A", "Disk-B"],
    );
    let written = records(12, BLOCK_RECORD);
    let two = second
        .write_session(&request("disk0"), written.clone(), &cancel)
        .unwrap();
    assert_eq!(one.session_id, two.session_id);
    let names: Vec<_> = two.volumes.iter().map(|span| span.volume.clone()).collect();
    assert_eq!(names, vec![volume("Disk-A"), volume("Disk-B")]);
    assert_ne!(two.volumes[1].start, one.volumes[0].start);

    let (read, back) = second
        .sessions()
        .read_records("disk0", &volume("Disk-A"), two.volumes[0].start, &cancel)
        .unwrap();
    assert_eq!(back, written);
    assert!(read.complete);
    assert_eq!(read.volumes, vec![volume("Disk-A"), volume("Disk-B")]);

    let (read, back) = second
        .sessions()
        .read_records("disk0", &volume("Disk-B"), one.volumes[0].start, &cancel)
        .unwrap();
    assert_eq!(back, earlier);
    assert!(read.complete);
}

#[test]
/// A restore can ask for some files or streams of a session only.
fn test_read_selected() {
    let dir = TempDir::new().unwrap();
    let daemon = daemon(
        test_config(dir.path()),
        vec![disk("disk0", &dir.path().join("media"))],
        &["Disk-0001"],
    );
    let cancel = CancelToken::new();
    let written = records(30, 300);
    let result = daemon
        .write_session(&request("disk0"), written.clone(), &cancel)
        .unwrap();
    let start = result.volumes[0].start;
    let read = |selection: &Selection| {
        let mut back = vec![];
        daemon
            .read_selected("disk0", &volume("Disk-0001"), start, selection, &cancel, |record| {
                back.push(record);
                Ok(())
            })
            .map(|read| (read, back))
    };

    let files = Selection::default().with_files(vec![FileRange::new(2, 3).unwrap()]);
    let (result_files, back) = read(&files).unwrap();
    assert_eq!(back, written[3..9].to_vec());
    assert_eq!(result_files.records, 6);
    assert_eq!(result_files.bytes, 6 * 300);
    assert!(result_files.complete);

    let streams = Selection {
        session: Some(result.session_id),
        ..Default::default()
    }
    .with_streams(vec![1]);
    let (_, back) = read(&streams).unwrap();
    let expected: Vec<_> = written.iter().filter(|r| r.stream == 1).cloned().collect();
    assert_eq!(back.len(), 10);
    assert_eq!(back, expected);

    let other = Selection {
        session: Some(SessionId(99)),
        ..Default::default()
    };
    assert_eq!(read(&other).unwrap_err().kind(), ErrorEnum::NotFound);
    assert_eq!(daemon.status().unwrap().devices[0].owner, None);
}

#[test]
/// A session continued onto a volume labeled ahead of time records where
/// it came from in its job media.
fn test_continue_on_labeled_volume() {
    let dir = TempDir::new().unwrap();
    let faults = FaultConfig {
        eom_after_blocks: Some(10),
        ..FaultConfig::default()
    };
    let daemon = daemon(
        test_config(dir.path()),
        vec![autoloader("loader0", &["Vol-A", "Vol-B"], Some(faults))],
        &["Vol-A"],
    );
    let cancel = CancelToken::new();
    daemon
        .label_volume("loader0", &volume("Vol-B"), &cancel)
        .unwrap();

    let written = records(15, BLOCK_RECORD);
    let result = daemon
        .write_session(&request("loader0"), written.clone(), &cancel)
        .unwrap();
    let names: Vec<_> = result.volumes.iter().map(|span| span.volume.clone()).collect();
    assert_eq!(names, vec![volume("Vol-A"), volume("Vol-B")]);

    let mut media = daemon.catalog().job_media(result.session_id).unwrap();
    media.sort_by_key(|m| m.volume_index);
    assert_eq!(media[0].prev_volume, None);
    assert_eq!(media[1].prev_volume, Some(volume("Vol-A")));

    let (_, back) = daemon
        .sessions()
        .read_records("loader0", &volume("Vol-A"), result.volumes[0].start, &cancel)
        .unwrap();
    assert_eq!(back, written);
}
