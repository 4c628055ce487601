//! Crash-recovery protocol over a populated document store: pending
//! documents are re-dispatched, in-progress documents resume without
//! re-running executed plugins, corrupt states are quarantined, and
//! completed documents are left alone.

mod common;

use std::fs;
use std::sync::Arc;

use steward_core::contracts::{DocumentStatus, PluginOutcome, PluginResult};
use steward_core::docstore::Folder;
use steward_daemon::processor::{PluginRunner, Processor};

use common::{
    plugin_state, sample_doc_state, test_config, wait_until, FakeMds, FakeRunner, INSTANCE,
};

fn build_processor(
    data_root: &std::path::Path,
    runner: Arc<FakeRunner>,
) -> (Arc<Processor<FakeMds>>, Arc<FakeMds>) {
    let mds = Arc::new(FakeMds::default());
    let runner_dyn: Arc<dyn PluginRunner> = runner;
    let processor = Arc::new(
        Processor::new(test_config(data_root), Arc::clone(&mds), runner_dyn).unwrap(),
    );
    (processor, mds)
}

#[test]
fn pending_documents_are_redispatched() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::success());
    let (processor, mds) = build_processor(dir.path(), Arc::clone(&runner));

    let message_id = format!("aws.ssm.cmd-1001.{INSTANCE}");
    let state = sample_doc_state(
        "doc-pending",
        &message_id,
        vec![plugin_state("aws:runShellScript", false, None)],
    );
    processor.store().persist(&state, Folder::Pending).unwrap();

    processor.process_pending_documents();

    let store = processor.store().clone();
    wait_until("pending document to complete", || {
        !store.enumerate(INSTANCE, Folder::Completed).is_empty()
    });

    let state = store.get("doc-pending", INSTANCE, Folder::Completed);
    assert_eq!(state.document_info.document_status, DocumentStatus::Success);
    assert_eq!(runner.invocation_count(), 1);
    assert_eq!(*mds.deletes.lock().unwrap(), vec![message_id]);

    processor.shutdown();
}

#[test]
fn resume_skips_plugins_that_already_executed() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::success());
    let (processor, _mds) = build_processor(dir.path(), Arc::clone(&runner));

    let message_id = format!("aws.ssm.cmd-1002.{INSTANCE}");
    let finished = PluginResult::now(PluginOutcome::Success {
        code: 0,
        output: "already done".to_string(),
    });
    let state = sample_doc_state(
        "doc-resume",
        &message_id,
        vec![
            plugin_state("aws:first", true, Some(finished)),
            plugin_state("aws:second", false, None),
        ],
    );
    processor.store().persist(&state, Folder::Current).unwrap();

    processor.process_in_progress_documents();

    let store = processor.store().clone();
    wait_until("resumed document to complete", || {
        !store.enumerate(INSTANCE, Folder::Completed).is_empty()
    });

    // Only the unfinished plugin reached the runner.
    assert_eq!(
        runner.invocations.lock().unwrap()[0],
        vec!["aws:second".to_string()]
    );

    let state = store.get("doc-resume", INSTANCE, Folder::Completed);
    assert_eq!(state.document_info.document_status, DocumentStatus::Success);
    // Both results are present in the terminal state.
    assert!(state.instance_plugins_information[0].result.is_some());
    assert!(state.instance_plugins_information[1].result.is_some());
    assert_eq!(state.document_info.runtime_status.len(), 2);

    processor.shutdown();
}

#[test]
fn corrupt_current_state_is_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::success());
    let (processor, _mds) = build_processor(dir.path(), Arc::clone(&runner));

    let store = processor.store().clone();
    let current = store.folder_path(INSTANCE, Folder::Current);
    fs::create_dir_all(&current).unwrap();
    fs::write(current.join("doc-garbled"), b"{ not a document state").unwrap();

    processor.process_in_progress_documents();

    assert!(store.enumerate(INSTANCE, Folder::Current).is_empty());
    assert_eq!(
        store.enumerate(INSTANCE, Folder::Corrupt),
        vec!["doc-garbled".to_string()]
    );
    assert_eq!(runner.invocation_count(), 0);

    processor.shutdown();
}

#[test]
fn completed_documents_are_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(FakeRunner::success());
    let (processor, mds) = build_processor(dir.path(), Arc::clone(&runner));

    let message_id = format!("aws.ssm.cmd-1003.{INSTANCE}");
    let mut state = sample_doc_state(
        "doc-done",
        &message_id,
        vec![plugin_state("aws:runShellScript", true, None)],
    );
    state.document_info.document_status = DocumentStatus::Success;
    processor.store().persist(&state, Folder::Completed).unwrap();

    processor.process_in_progress_documents();
    processor.process_pending_documents();
    processor.shutdown();

    assert_eq!(runner.invocation_count(), 0);
    assert!(mds.deletes.lock().unwrap().is_empty());
    assert_eq!(
        processor.store().enumerate(INSTANCE, Folder::Completed),
        vec!["doc-done".to_string()]
    );
}
