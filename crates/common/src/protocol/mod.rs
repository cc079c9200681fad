// Wire payloads delivered to change subscribers.

pub mod notification;
