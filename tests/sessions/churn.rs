//! Objects and properties deleted and recreated across sessions

use crate::common::*;

#[test]
fn test_created_object_becomes_target_object() {
    let doc = document(2);
    let mut first = session(&doc.target);
    let page = first.create_object().unwrap();
    first.add_value(page, BODY, TEXT, &[b'n'; 32]).unwrap();
    first.delete_object(doc.pages[0]).unwrap();
    let (image1, _) = close(first);
    let target1 = replay(doc.target.clone(), &[image1.clone()])
        .into_target()
        .unwrap();

    let mut second = session(&target1);
    let title = second.value(doc.pages[1], TITLE, TEXT).unwrap();
    second.move_value(title, page, TITLE).unwrap();
    let body = second.value(page, BODY, TEXT).unwrap();
    second.insert_value_data(body, 16, b"--").unwrap();
    let (image2, expected) = close(second);
    assert!(image2.new_objects.is_empty());

    let container = replay(doc.target, &[image1, image2]);
    assert_eq!(container.contents().unwrap(), expected);
}

#[test]
fn test_property_readded_in_next_session() {
    let doc = document(1);
    let page = doc.pages[0];
    let mut first = session(&doc.target);
    first.delete_property(page, BODY).unwrap();
    let err = first.add_value(page, BODY, TEXT, b"again").unwrap_err();
    assert!(matches!(err, bento::Error::InvalidOperation(_)));
    let (image1, _) = close(first);
    let target1 = replay(doc.target.clone(), &[image1.clone()])
        .into_target()
        .unwrap();

    let mut second = session(&target1);
    second.add_value(page, BODY, TEXT, b"again").unwrap();
    let (image2, expected) = close(second);
    let container = replay(doc.target, &[image1, image2]);
    assert_eq!(container.contents().unwrap(), expected);
}

#[test]
fn test_every_page_edited() {
    let doc = document(12);
    let mut container = session(&doc.target);
    for (i, page) in doc.pages.iter().enumerate() {
        let body = container.value(*page, BODY, TEXT).unwrap();
        container
            .insert_value_data(body, (i * 10) as u32, format!("<{}>", i).as_bytes())
            .unwrap();
        if i % 3 == 0 {
            let title = container.value(*page, TITLE, TEXT).unwrap();
            container.delete_value(title).unwrap();
        }
    }
    let (image, expected) = close(container);
    assert_eq!(image.streams.len(), doc.pages.len());
    let replayed = replay(doc.target, &[image]);
    assert_eq!(replayed.contents().unwrap(), expected);
}
