//! Tests for the event bus and sinks

use std::sync::Arc;

use prometheus_task_engine::core::{EngineEvent, EventBus, EventSink, InMemoryEventSink, SchedulerError};
use prometheus_task_engine::util::{Priority, TaskId};

#[test]
fn test_sinks_observe_events_in_order() {
    let bus = EventBus::new(8, 4);
    let sink = InMemoryEventSink::new(8);
    bus.attach(Arc::new(sink.clone())).unwrap();

    let id = TaskId::new();
    bus.publish_all(vec![
        EngineEvent::TaskAdded {
            task_id: id,
            name: "job".into(),
            priority: Priority::High,
        },
        EngineEvent::TaskStarted { task_id: id, attempt: 0 },
        EngineEvent::TaskCompleted { task_id: id, duration_ms: 3 },
    ]);

    assert_eq!(sink.names(), vec!["task:added", "task:started", "task:completed"]);
}

#[test]
fn test_custom_sink() {
    struct Counter(parking_lot::Mutex<usize>);

    impl EventSink for Counter {
        fn record(&self, _event: &EngineEvent) {
            *self.0.lock() += 1;
        }
    }

    let bus = EventBus::new(8, 1);
    let counter = Arc::new(Counter(parking_lot::Mutex::new(0)));
    bus.attach(Arc::clone(&counter) as Arc<dyn EventSink>).unwrap();
    bus.publish(EngineEvent::QueueCleared { count: 0 });
    bus.publish(EngineEvent::QueueCleared { count: 1 });
    assert_eq!(*counter.0.lock(), 2);

    let err = bus.attach(Arc::new(InMemoryEventSink::new(1))).unwrap_err();
    assert_eq!(err, SchedulerError::TooManySubscribers(1));
}

#[test]
fn test_event_json_shape() {
    let event = EngineEvent::QueueFull {
        task_id: TaskId::new(),
        size: 11,
        capacity: 10,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "queue_full");
    assert_eq!(json["size"], 11);
    let back: EngineEvent = serde_json::from_value(json).unwrap();
    assert_eq!(back, event);
}
