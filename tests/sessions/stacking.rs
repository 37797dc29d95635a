//! Update images stacked over several sessions

use crate::common::*;
use tempfile::TempDir;

#[test]
fn test_three_sessions_through_files() {
    let dir = TempDir::new().unwrap();
    let doc = document(3);
    let (p0, p1, p2) = (doc.pages[0], doc.pages[1], doc.pages[2]);

    let mut first = session(&doc.target);
    let body = first.value(p0, BODY, TEXT).unwrap();
    first.delete_value_data(body, 40, 16).unwrap();
    first.insert_value_data(body, 40, b"[edited]").unwrap();
    let (image1, _) = close(first);
    let image1 = through_file(&dir, "1.bnu", &image1);
    let target1 = replay(doc.target.clone(), &[image1.clone()])
        .into_target()
        .unwrap();

    let mut second = session(&target1);
    let title = second.value(p1, TITLE, TEXT).unwrap();
    second.move_value(title, p0, NOTES).unwrap();
    second.delete_object(p2).unwrap();
    let (image2, _) = close(second);
    let image2 = through_file(&dir, "2.bnu", &image2);
    let target2 = replay(target1, &[image2.clone()]).into_target().unwrap();

    let mut third = session(&target2);
    let page = third.create_object().unwrap();
    third.add_value(page, TITLE, TEXT, b"p3").unwrap();
    let notes = third.value(p0, NOTES, TEXT).unwrap();
    third.set_value_info(notes, RAW, 2).unwrap();
    let (image3, expected) = close(third);
    let image3 = through_file(&dir, "3.bnu", &image3);

    let container = replay(doc.target, &[image1, image2, image3]);
    assert_eq!(container.layer_count(), 4);
    assert_eq!(container.contents().unwrap(), expected);
    let notes = container.value(p0, NOTES, RAW).unwrap();
    assert_eq!(container.read_value(notes).unwrap(), b"p1".to_vec());
    assert!(container.graph().object(p2).is_none());
}

#[test]
fn test_images_must_stack_in_order() {
    let doc = document(1);
    let (image1, _) = close(session(&doc.target));
    let target1 = replay(doc.target.clone(), &[image1])
        .into_target()
        .unwrap();
    let (image2, _) = close(session(&target1));

    let mut container = Container::open(doc.target, config()).unwrap();
    let err = container.apply_image(&image2).unwrap_err();
    assert!(matches!(err, bento::Error::Corruption(_)));
}

#[test]
fn test_replayed_target_accepts_new_session() {
    let doc = document(2);
    let mut first = session(&doc.target);
    let body = first.value(doc.pages[1], BODY, TEXT).unwrap();
    first.write_value_data(body, 0, b"overwritten").unwrap();
    let (image, _) = close(first);
    let target1 = replay(doc.target, &[image]).into_target().unwrap();

    let mut second = session(&target1);
    let body = second.value(doc.pages[1], BODY, TEXT).unwrap();
    assert_eq!(&second.read_value(body).unwrap()[..11], b"overwritten");
    second.delete_value_data(body, 0, 11).unwrap();
    let (image, expected) = close(second);
    let container = replay(target1, &[image]);
    assert_eq!(container.contents().unwrap(), expected);
}
