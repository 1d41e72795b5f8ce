//! XML pinning-history persistence (§6): `<XMLPinningHistory>` with a
//! `<Pinnings>` section holding one `<Phase>` per execution phase and one
//! `<Pinning sched="c0:c1:...">` per recorded candidate.

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

use crate::error::{errors, AutopinError};
use crate::pinning::{OptimisationDirection, Pinning, PinningHistory, Task};

pub fn save_history(history: &PinningHistory, host: &str, date: &str, time: &str) -> String {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Start(BytesStart::new("XMLPinningHistory")))
        .unwrap();

    writer.write_event(Event::Start(BytesStart::new("Environment"))).unwrap();
    write_text_elem(&mut writer, "Host", host);
    write_text_elem(&mut writer, "Date", date);
    write_text_elem(&mut writer, "Time", time);
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("Environment"))).unwrap();

    writer.write_event(Event::Start(BytesStart::new("Pinnings"))).unwrap();
    for phase in history.phases() {
        let mut phase_tag = BytesStart::new("Phase");
        phase_tag.push_attribute(("id", phase.to_string().as_str()));
        writer.write_event(Event::Start(phase_tag)).unwrap();

        for entry in history.entries(phase) {
            let sched = render_sched(&entry.pinning);
            let mut pinning_tag = BytesStart::new("Pinning");
            pinning_tag.push_attribute(("sched", sched.as_str()));
            writer.write_event(Event::Start(pinning_tag)).unwrap();
            writer
                .write_event(Event::Text(BytesText::new(&entry.value.to_string())))
                .unwrap();
            writer.write_event(Event::End(quick_xml::events::BytesEnd::new("Pinning"))).unwrap();
        }
        writer.write_event(Event::End(quick_xml::events::BytesEnd::new("Phase"))).unwrap();
    }
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("Pinnings"))).unwrap();

    writer
        .write_event(Event::End(quick_xml::events::BytesEnd::new("XMLPinningHistory")))
        .unwrap();

    String::from_utf8(writer.into_inner().into_inner()).unwrap()
}

fn write_text_elem<W: std::io::Write>(writer: &mut Writer<W>, tag: &str, text: &str) {
    writer.write_event(Event::Start(BytesStart::new(tag))).unwrap();
    writer.write_event(Event::Text(BytesText::new(text))).unwrap();
    writer
        .write_event(Event::End(quick_xml::events::BytesEnd::new(tag)))
        .unwrap();
}

fn render_sched(pinning: &Pinning) -> String {
    pinning
        .slots()
        .iter()
        .map(|slot| match slot {
            Some(task) => task.tid.to_string(),
            None => "-1".to_string(),
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_sched(sched: &str, core_count: usize) -> Pinning {
    let cores: Vec<i64> = sched.split(':').filter_map(|s| s.parse::<i64>().ok()).collect();
    Pinning::from_core_indices(core_count, &cores)
}

/// Loads a history saved by [`save_history`]. Requires exact tag matches
/// per §6; any other root element is a `History` error.
pub fn load_history(
    xml: &str,
    core_count: usize,
    direction: OptimisationDirection,
) -> Result<PinningHistory, AutopinError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut history = PinningHistory::new(direction);
    let mut current_phase: Option<u32> = None;
    let mut current_sched: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"Phase" => {
                    let id = attr_value(&e, "id").ok_or_else(|| errors::history("load", "Phase missing id"))?;
                    current_phase = Some(
                        id.parse()
                            .map_err(|_| errors::history("load", "Phase id not an integer"))?,
                    );
                }
                b"Pinning" => {
                    current_sched = attr_value(&e, "sched");
                }
                b"XMLPinningHistory" | b"Environment" | b"Pinnings" | b"Host" | b"Date" | b"Time" => {}
                other => {
                    return Err(errors::history(
                        "load",
                        format!("unexpected tag <{}>", String::from_utf8_lossy(other)),
                    ))
                }
            },
            Ok(Event::Text(t)) => {
                if let (Some(phase), Some(sched)) = (current_phase, &current_sched) {
                    let text = t.unescape().unwrap_or_default();
                    if let Ok(value) = text.parse::<f64>() {
                        let pinning = parse_sched(sched, core_count);
                        history.record(phase, pinning, value);
                    }
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"Pinning" => current_sched = None,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(errors::history("load", e.to_string())),
        }
        buf.clear();
    }

    Ok(history)
}

fn attr_value(tag: &BytesStart, key: &str) -> Option<String> {
    tag.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == key.as_bytes() {
            Some(String::from_utf8_lossy(&a.value).into_owned())
        } else {
            None
        }
    })
}

#[allow(dead_code)]
fn task_from_tid(tid: u32) -> Task {
    Task { pid: 0, tid }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinning::Task;

    #[test]
    fn property_6_round_trip_preserves_phase_pinning_value_triples() {
        let mut h = PinningHistory::new(OptimisationDirection::Max);
        let mut p0 = Pinning::empty(4);
        p0.assign(0, Task { pid: 1, tid: 10 });
        p0.assign(1, Task { pid: 1, tid: 11 });
        h.record(0, p0.clone(), 5.0);

        let mut p1 = Pinning::empty(4);
        p1.assign(2, Task { pid: 1, tid: 12 });
        h.record(0, p1.clone(), 8.0);

        let xml = save_history(&h, "host1", "2026-01-01", "12:00:00");
        let loaded = load_history(&xml, 4, OptimisationDirection::Max).unwrap();

        assert_eq!(loaded.best(0).unwrap().value, h.best(0).unwrap().value);
        assert_eq!(loaded.entries(0).len(), h.entries(0).len());
    }

    #[test]
    fn unexpected_root_tag_is_a_history_error() {
        let xml = "<NotAHistory></NotAHistory>";
        assert!(load_history(xml, 4, OptimisationDirection::Max).is_err());
    }

    #[test]
    fn render_sched_uses_minus_one_for_empty_slots() {
        let mut p = Pinning::empty(3);
        p.assign(1, Task { pid: 1, tid: 99 });
        assert_eq!(render_sched(&p), "-1:99:-1");
    }
}
