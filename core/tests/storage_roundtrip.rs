// Round-trip laws across the storage layers: phrase-index images through
// the filesystem, and bigram databases through attach/save/load cycles.

use std::path::PathBuf;

use libhanyu_core::{
    make_token, AttachMode, Bigram, FacadePhraseIndex, MatchOptions, MemoryChunk, PhraseItem,
    SingleGram, SyllableKey,
};

fn temp_path(tag: &str, ext: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!(
        "libhanyu_it_{}_{}.{}",
        tag,
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos(),
        ext
    ));
    p
}

fn key(i: u8, f: u8, t: u8) -> SyllableKey {
    SyllableKey::new(i, f, t)
}

#[test]
fn phrase_index_image_survives_the_filesystem() {
    let mut index = FacadePhraseIndex::new();
    let token = make_token(1, 3);
    let mut item = PhraseItem::new();
    item.set_phrase("中国").unwrap();
    item.append_pronunciation(&[key(11, 30, 1), key(12, 31, 2)], 77)
        .unwrap();
    item.set_unigram_frequency(77);
    index.add_phrase_item(token, &item).unwrap();

    let mut image = MemoryChunk::new();
    index.store(1, &mut image).unwrap();
    let path = temp_path("phrase_image", "bin");
    image.save(&path).unwrap();

    let loaded_chunk = MemoryChunk::load(&path).unwrap();
    assert_eq!(loaded_chunk.as_slice(), image.as_slice());

    let mut restored = FacadePhraseIndex::new();
    restored.load(1, &loaded_chunk).unwrap();
    assert_eq!(restored.phrase_index_total_freq(), 77);
    let view = restored.get_phrase_item(token).unwrap();
    assert_eq!(view.phrase_string(), "中国");
    let (keys, freq) = view.get_nth_pronunciation(0).unwrap();
    assert_eq!(keys, vec![key(11, 30, 1), key(12, 31, 2)]);
    assert_eq!(freq, 77);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn text_dictionary_round_trips_through_a_binary_image() {
    let ni = key(8, 10, 3).as_u16();
    let hao = key(9, 20, 3).as_u16();
    let t_ni = make_token(1, 1);
    let t_nihao = make_token(1, 2);
    let text = format!("{ni} 你 {t_ni} 500\n{ni},{hao} 你好 {t_nihao} 300\n");

    let mut index = FacadePhraseIndex::new();
    index.load_text(1, text.as_bytes()).unwrap();
    assert_eq!(index.phrase_index_total_freq(), 800);

    let mut image = MemoryChunk::new();
    index.store(1, &mut image).unwrap();
    let mut restored = FacadePhraseIndex::new();
    restored.load(1, &image).unwrap();

    for token in [t_ni, t_nihao] {
        let a = index.get_phrase_item(token).unwrap();
        let b = restored.get_phrase_item(token).unwrap();
        assert_eq!(a.phrase_string(), b.phrase_string());
        assert_eq!(a.unigram_frequency(), b.unigram_frequency());
        assert_eq!(a.get_nth_pronunciation(0), b.get_nth_pronunciation(0));
    }
    let opts = MatchOptions::default();
    let view = restored.get_phrase_item(t_nihao).unwrap();
    assert!(
        (view.pinyin_possibility(
            opts,
            &[SyllableKey::from_u16(ni), SyllableKey::from_u16(hao)]
        ) - 1.0)
            .abs()
            < 1e-6
    );
}

#[test]
fn bigram_database_survives_attach_cycles() {
    let path = temp_path("bigram_attach", "redb");
    let mut gram = SingleGram::new();
    gram.insert_freq(make_token(1, 2), 40).unwrap();
    gram.insert_freq(make_token(1, 9), 60).unwrap();
    gram.set_total_freq(100);

    {
        let mut store = Bigram::new();
        store.attach(&path, AttachMode::Create).unwrap();
        store.store(make_token(1, 1), &gram).unwrap();
    }
    {
        let mut store = Bigram::new();
        store.attach(&path, AttachMode::ReadOnly).unwrap();
        let loaded = store.load(make_token(1, 1)).unwrap().unwrap();
        assert_eq!(loaded.as_bytes(), gram.as_bytes());
        assert_eq!(store.get_all_items().unwrap(), vec![make_token(1, 1)]);
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
fn in_memory_companion_saves_atomically_and_reloads() {
    let path = temp_path("bigram_companion", "redb");

    let store = Bigram::in_memory().unwrap();
    for id in 1..=5u32 {
        let mut gram = SingleGram::new();
        gram.insert_freq(make_token(1, id + 10), id * 7).unwrap();
        gram.set_total_freq(id * 7);
        store.store(make_token(1, id), &gram).unwrap();
    }
    store.save_db(&path).unwrap();

    // overwrite with a later state, saving over the same file
    let mut gram = SingleGram::new();
    gram.insert_freq(make_token(1, 99), 1).unwrap();
    gram.set_total_freq(1);
    store.store(make_token(1, 6), &gram).unwrap();
    store.save_db(&path).unwrap();

    let mut restored = Bigram::new();
    restored.load_db(&path).unwrap();
    let items = restored.get_all_items().unwrap();
    assert_eq!(items.len(), 6);
    for token in items {
        assert_eq!(
            restored.load(token).unwrap().unwrap().as_bytes(),
            store.load(token).unwrap().unwrap().as_bytes()
        );
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
fn mask_out_prunes_a_whole_library_from_disk() {
    let path = temp_path("bigram_mask", "redb");
    let lib1 = make_token(1, 0);
    let lib2 = make_token(2, 0);
    {
        let mut store = Bigram::new();
        store.attach(&path, AttachMode::Create).unwrap();
        let mut gram = SingleGram::new();
        gram.insert_freq(lib1 | 5, 3).unwrap();
        gram.insert_freq(lib2 | 5, 4).unwrap();
        gram.set_total_freq(7);
        store.store(lib1 | 1, &gram).unwrap();
        store.store(lib2 | 1, &gram).unwrap();

        store.mask_out(0xFF00_0000, lib2).unwrap();
    }
    let mut store = Bigram::new();
    store.attach(&path, AttachMode::ReadWrite).unwrap();
    assert_eq!(store.get_all_items().unwrap(), vec![lib1 | 1]);
    let gram = store.load(lib1 | 1).unwrap().unwrap();
    assert_eq!(gram.retrieve_all(), vec![(lib1 | 5, 3)]);
    assert_eq!(gram.get_total_freq(), 3);

    let _ = std::fs::remove_file(&path);
}
