mod common;

use agent_orchestra::status::StatusStore;
use agent_orchestra::{ActivityState, BackendError, NewSession, OrchestraError, SessionStatus};
use common::Fixture;

fn new_session(fixture: &Fixture, label: &str) -> NewSession {
    NewSession {
        working_dir: fixture.project(),
        label: label.to_string(),
        branch: Some("main".to_string()),
        command: None,
    }
}

#[tokio::test]
async fn test_create_session_starts_wrapped_agent() {
    let fixture = Fixture::new(&[]);
    let mut orchestra = fixture.orchestra();

    let id = orchestra
        .create_session(new_session(&fixture, "Fix login bug"))
        .await
        .unwrap();

    let created = fixture.backend.state().created.clone();
    assert_eq!(created.len(), 1);
    let (handle, command, working_dir) = &created[0];
    assert_eq!(handle, &format!("co-{}", id));
    assert_eq!(
        command,
        &vec![
            "/usr/local/bin/orchestra".to_string(),
            "wrap".to_string(),
            "--session-id".to_string(),
            id.clone(),
            "--".to_string(),
            "claude".to_string(),
        ]
    );
    assert_eq!(working_dir, &fixture.project());

    let views = orchestra.list_sessions().unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].session.label, "Fix login bug");
    assert_eq!(views[0].session.branch.as_deref(), Some("main"));
    assert_eq!(views[0].status.state, ActivityState::Unknown);
}

#[tokio::test]
async fn test_create_with_custom_command() {
    let fixture = Fixture::new(&[]);
    let mut orchestra = fixture.orchestra();
    let mut request = new_session(&fixture, "task");
    request.command = Some(vec!["aider".into(), "--yes".into()]);

    orchestra.create_session(request).await.unwrap();
    let created = fixture.backend.state().created.clone();
    assert!(created[0].1.ends_with(&["aider".to_string(), "--yes".to_string()]));
}

#[tokio::test]
async fn test_failed_backend_create_rolls_back() {
    let fixture = Fixture::new(&[]);
    fixture.backend.state().fail_create = true;
    let mut orchestra = fixture.orchestra();

    let err = orchestra
        .create_session(new_session(&fixture, "task"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestraError::Backend(BackendError::Unavailable(_))
    ));
    assert!(orchestra.list_sessions().unwrap().is_empty());
}

#[tokio::test]
async fn test_create_rejects_missing_directory() {
    let fixture = Fixture::new(&[]);
    let mut orchestra = fixture.orchestra();
    let mut request = new_session(&fixture, "task");
    request.working_dir = fixture.dir.path().join("nowhere");

    assert!(matches!(
        orchestra.create_session(request).await,
        Err(OrchestraError::InvalidWorkingDir(_))
    ));
    assert!(fixture.backend.state().created.is_empty());
}

#[tokio::test]
async fn test_status_defaults_to_unknown() {
    let fixture = Fixture::new(&[]);
    let mut orchestra = fixture.orchestra();
    let id = orchestra
        .create_session(new_session(&fixture, "task"))
        .await
        .unwrap();

    assert_eq!(
        orchestra.get_status(&id).unwrap().state,
        ActivityState::Unknown
    );

    StatusStore::new(fixture.paths.status_dir())
        .write(&id, &SessionStatus::new(ActivityState::Waiting, "Proceed? [y/n]"))
        .unwrap();
    let status = orchestra.get_status(&id).unwrap();
    assert_eq!(status.state, ActivityState::Waiting);
    assert_eq!(status.last_output, "Proceed? [y/n]");

    assert!(matches!(
        orchestra.get_status("missing"),
        Err(OrchestraError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_send_input_goes_to_backend() {
    let fixture = Fixture::new(&[]);
    let mut orchestra = fixture.orchestra();
    let id = orchestra
        .create_session(new_session(&fixture, "task"))
        .await
        .unwrap();

    orchestra.send_input(&id, b"y\n").await.unwrap();
    let keys = fixture.backend.state().keys.clone();
    assert_eq!(keys, vec![(format!("co-{}", id), b"y\n".to_vec())]);

    assert!(matches!(
        orchestra.send_input("missing", b"y").await,
        Err(OrchestraError::NotFound(_))
    ));

    fixture.backend.state().live.clear();
    assert!(matches!(
        orchestra.send_input(&id, b"y").await,
        Err(OrchestraError::Backend(BackendError::NotFound(_)))
    ));
}

#[tokio::test]
async fn test_send_input_is_byte_faithful() {
    let fixture = Fixture::new(&[]);
    let mut orchestra = fixture.orchestra();
    let id = orchestra
        .create_session(new_session(&fixture, "task"))
        .await
        .unwrap();

    orchestra.send_input(&id, b"\xff\x03ok\r\n").await.unwrap();
    let keys = fixture.backend.state().keys.clone();
    assert_eq!(keys[0].1, b"\xff\x03ok\r\n".to_vec());
}

#[tokio::test]
async fn test_send_key_presses_named_key() {
    let fixture = Fixture::new(&[]);
    let mut orchestra = fixture.orchestra();
    let id = orchestra
        .create_session(new_session(&fixture, "task"))
        .await
        .unwrap();

    orchestra.send_key(&id, "C-c").await.unwrap();
    assert_eq!(
        fixture.backend.state().named_keys,
        vec![(format!("co-{}", id), "C-c".to_string())]
    );
    assert!(fixture.backend.state().keys.is_empty());

    assert!(matches!(
        orchestra.send_key(&id, "").await,
        Err(OrchestraError::InvalidKey(_))
    ));
    assert!(matches!(
        orchestra.send_key(&id, "C-c; kill").await,
        Err(OrchestraError::InvalidKey(_))
    ));
    assert!(matches!(
        orchestra.send_key("missing", "Tab").await,
        Err(OrchestraError::NotFound(_))
    ));
    assert_eq!(fixture.backend.state().named_keys.len(), 1);
}

#[tokio::test]
async fn test_capture_output_tail() {
    let fixture = Fixture::new(&[]);
    let mut orchestra = fixture.orchestra();
    let id = orchestra
        .create_session(new_session(&fixture, "task"))
        .await
        .unwrap();
    fixture
        .backend
        .state()
        .panes
        .insert(format!("co-{}", id), "one\ntwo\nthree\n\n".to_string());

    assert_eq!(
        orchestra.capture_output(&id, Some(2)).await.unwrap(),
        "two\nthree\n"
    );
    assert_eq!(
        orchestra.capture_output(&id, None).await.unwrap(),
        "one\ntwo\nthree\n\n"
    );
}

#[tokio::test]
async fn test_delete_session_cleans_up() {
    let fixture = Fixture::new(&[]);
    let mut orchestra = fixture.orchestra();
    let id = orchestra
        .create_session(new_session(&fixture, "task"))
        .await
        .unwrap();
    let store = StatusStore::new(fixture.paths.status_dir());
    store
        .write(&id, &SessionStatus::new(ActivityState::Idle, ""))
        .unwrap();

    orchestra.delete_session(&id).await.unwrap();
    assert_eq!(fixture.backend.state().killed, vec![format!("co-{}", id)]);
    assert!(orchestra.list_sessions().unwrap().is_empty());
    assert!(store.read(&id).is_none());

    assert!(matches!(
        orchestra.delete_session(&id).await,
        Err(OrchestraError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_tolerates_vanished_backend_session() {
    let fixture = Fixture::new(&[]);
    let mut orchestra = fixture.orchestra();
    let id = orchestra
        .create_session(new_session(&fixture, "task"))
        .await
        .unwrap();
    fixture.backend.state().live.clear();

    orchestra.delete_session(&id).await.unwrap();
    assert!(orchestra.list_sessions().unwrap().is_empty());
}

#[tokio::test]
async fn test_label_update_persists() {
    let fixture = Fixture::new(&[]);
    let id = {
        let mut orchestra = fixture.orchestra();
        let id = orchestra
            .create_session(new_session(&fixture, "old"))
            .await
            .unwrap();
        let updated = orchestra.update_label(&id, "new").unwrap();
        assert_eq!(updated.label, "new");
        id
    };

    let mut reopened = fixture.orchestra();
    assert_eq!(reopened.session(&id).unwrap().label, "new");
    assert!(matches!(
        reopened.update_label("missing", "x"),
        Err(OrchestraError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_refresh_branch_outside_repository() {
    let fixture = Fixture::new(&[]);
    let mut orchestra = fixture.orchestra();
    let id = orchestra
        .create_session(new_session(&fixture, "task"))
        .await
        .unwrap();

    assert_eq!(orchestra.refresh_branch(&id).await.unwrap(), None);
    assert_eq!(orchestra.session(&id).unwrap().branch, None);
}

#[tokio::test]
async fn test_sessions_created_elsewhere_are_visible() {
    let fixture = Fixture::new(&[]);
    let mut first = fixture.orchestra();
    let mut second = fixture.orchestra();

    let id = first
        .create_session(new_session(&fixture, "task"))
        .await
        .unwrap();
    assert_eq!(second.session(&id).unwrap().label, "task");
    assert_eq!(second.list_sessions().unwrap().len(), 1);
}
