//! End-to-end tests driving the real worker binary over the process
//! pipes, through the service-side task API.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use tandem_service::{Args, DType, NDArray, ResponseType, Service, Task, TaskStatus};

fn worker_exe() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_tandem-worker"))
}

fn spawn_worker() -> Service {
    Service::spawn(worker_exe(), &[], &std::env::temp_dir()).unwrap()
}

async fn wait_running(task: &Task) {
    for _ in 0..500 {
        if task.status() == TaskStatus::Running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached RUNNING", task.uuid());
}

#[tokio::test]
async fn script_result_comes_back_as_output() {
    let service = spawn_worker();
    let task = service.task("2 + 2", Args::new()).unwrap();
    let status = task.wait_for(Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(status, TaskStatus::Complete);
    assert_eq!(task.outputs().get("result"), Some(&json!(4)));
    service.close().await.unwrap();
}

#[tokio::test]
async fn inputs_are_bound_as_variables() {
    let service = spawn_worker();
    let mut inputs = Args::new();
    inputs.insert("age".to_string(), json!(7));
    let task = service.task("age * age", inputs).unwrap();
    let status = task.wait_for(Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(status, TaskStatus::Complete);
    assert_eq!(task.outputs().get("result"), Some(&json!(49)));
    service.close().await.unwrap();
}

#[tokio::test]
async fn named_outputs_and_result_both_arrive() {
    let service = spawn_worker();
    let task = service
        .task("out(\"greeting\", \"hi \" + name)\n1 + 1", {
            let mut inputs = Args::new();
            inputs.insert("name".to_string(), json!("world"));
            inputs
        })
        .unwrap();
    task.wait_for(Some(Duration::from_secs(10))).await.unwrap();
    let outputs = task.outputs();
    assert_eq!(outputs.get("greeting"), Some(&json!("hi world")));
    assert_eq!(outputs.get("result"), Some(&json!(2)));
    service.close().await.unwrap();
}

#[tokio::test]
async fn progress_updates_stream_back() {
    let script = "\
i = 0
while i < 3 {
    update(\"working\", i, 3)
    i = i + 1
}
i";
    let service = spawn_worker();
    let task = service.task(script, Args::new()).unwrap();

    let updates: Arc<Mutex<Vec<(Option<i64>, Option<i64>)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = updates.clone();
    task.listen(move |event| {
        if event.response_type == ResponseType::Update {
            seen.lock().push((event.current, event.maximum));
        }
    })
    .unwrap();

    let status = task.wait_for(Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(status, TaskStatus::Complete);
    assert_eq!(task.outputs().get("result"), Some(&json!(3)));
    assert_eq!(
        *updates.lock(),
        vec![(Some(0), Some(3)), (Some(1), Some(3)), (Some(2), Some(3))]
    );
    assert_eq!(task.message().as_deref(), Some("working"));
    assert_eq!(task.current(), 2);
    assert_eq!(task.maximum(), 3);
    service.close().await.unwrap();
}

#[tokio::test]
async fn cancel_stops_a_running_script() {
    let service = spawn_worker();
    let task = service
        .task("while true { sleep(50) }", Args::new())
        .unwrap();
    task.start().await.unwrap();
    wait_running(&task).await;

    task.cancel().await.unwrap();
    let status = task.wait_for(Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(status, TaskStatus::Canceled);
    assert!(task.outputs().is_empty());
    service.close().await.unwrap();
}

#[tokio::test]
async fn script_failure_carries_the_error() {
    let service = spawn_worker();
    let task = service.task("1 / 0", Args::new()).unwrap();
    let status = task.wait_for(Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(status, TaskStatus::Failed);
    assert!(task.error().unwrap().contains("division by zero"));
    service.close().await.unwrap();
}

#[tokio::test]
async fn default_lane_runs_tasks_in_order() {
    let service = spawn_worker();
    let first = service.task("sleep(100)\n1", Args::new()).unwrap();
    let second = service.task("2", Args::new()).unwrap();

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    for (tag, task) in [("first", &first), ("second", &second)] {
        let log = events.clone();
        task.listen(move |event| {
            log.lock().push(format!("{tag}:{}", event.response_type));
        })
        .unwrap();
    }

    first.start().await.unwrap();
    second.start().await.unwrap();
    first.wait_for(Some(Duration::from_secs(10))).await.unwrap();
    second.wait_for(Some(Duration::from_secs(10))).await.unwrap();

    assert_eq!(
        *events.lock(),
        vec![
            "first:LAUNCH",
            "first:COMPLETION",
            "second:LAUNCH",
            "second:COMPLETION"
        ]
    );
    service.close().await.unwrap();
}

#[tokio::test]
async fn named_queues_run_concurrently() {
    let service = spawn_worker();
    // Each blocks until canceled; with one lane the second would starve.
    let a = service
        .task_on("while true { sleep(50) }", Args::new(), Some("q1"))
        .unwrap();
    let b = service
        .task_on("while true { sleep(50) }", Args::new(), Some("q2"))
        .unwrap();
    a.start().await.unwrap();
    b.start().await.unwrap();
    wait_running(&a).await;
    wait_running(&b).await;

    a.cancel().await.unwrap();
    b.cancel().await.unwrap();
    assert_eq!(
        a.wait_for(Some(Duration::from_secs(10))).await.unwrap(),
        TaskStatus::Canceled
    );
    assert_eq!(
        b.wait_for(Some(Duration::from_secs(10))).await.unwrap(),
        TaskStatus::Canceled
    );
    service.close().await.unwrap();
}

#[tokio::test]
async fn graceful_close_exits_zero() {
    let service = spawn_worker();
    let task = service.task("40 + 2", Args::new()).unwrap();
    task.wait_for(Some(Duration::from_secs(10))).await.unwrap();

    service.close().await.unwrap();
    assert!(service.closed());
    assert_eq!(service.exit_code(), Some(0));
}

#[tokio::test]
async fn killed_worker_crashes_pending_tasks() {
    let service = spawn_worker();
    let task = service
        .task("while true { sleep(50) }", Args::new())
        .unwrap();
    task.start().await.unwrap();
    wait_running(&task).await;

    let pid = service.pid().unwrap();
    let killed = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(killed.success());

    let status = task.wait_for(Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(status, TaskStatus::Crashed);
    assert!(task.error().is_some());
    assert!(service.closed());
    assert!(service.task("more", Args::new()).is_err());
}

#[tokio::test]
async fn unknown_flavor_fails_fast() {
    let service = Service::spawn(
        worker_exe(),
        &["--flavor".to_string(), "nonexistent".to_string()],
        &std::env::temp_dir(),
    )
    .unwrap();
    // The worker refuses to start; the monitor notices and closes the
    // service without any task ever running.
    for _ in 0..500 {
        if service.exit_code().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(service.exit_code(), Some(2));
    assert!(service.closed());
}

#[tokio::test]
async fn ndarray_descriptor_passes_through_untouched() {
    let (descriptor, mut region) = NDArray::create(DType::Uint8, vec![4, 4]).unwrap();
    let pattern: Vec<u8> = (0..16u8).collect();
    region.as_mut_slice().unwrap().copy_from_slice(&pattern);

    let service = spawn_worker();
    let mut inputs = Args::new();
    inputs.insert("img".to_string(), descriptor.to_value());
    let task = service.task("out(\"img\", img)\nnull", inputs).unwrap();
    let status = task.wait_for(Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(status, TaskStatus::Complete);

    let value = task.outputs().get("img").cloned().unwrap();
    assert!(NDArray::is_ndarray(&value));
    let back = NDArray::from_value(&value).unwrap();
    assert_eq!(back, descriptor);

    // The region is shared, not copied: the attached view sees the
    // creator's bytes.
    let attached = back.open().unwrap();
    assert_eq!(attached.as_slice().unwrap(), &pattern[..]);
    service.close().await.unwrap();
}
