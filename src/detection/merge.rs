//! Coalescing of overlapping flaw boxes.

use super::types::FlawBox;

/// First intersecting pair `(i, j)`, `i < j`, in lexicographic order.
fn first_overlapping_pair(boxes: &[FlawBox]) -> Option<(usize, usize)> {
    (0..boxes.len())
        .flat_map(|i| (i + 1..boxes.len()).map(move |j| (i, j)))
        .find(|&(i, j)| boxes[i].intersects(&boxes[j]))
}

/// Repeatedly replace the first overlapping pair with its union, stored at the
/// lower index, until no two boxes intersect. Surviving boxes keep their
/// relative order.
pub fn merge(mut boxes: Vec<FlawBox>) -> Vec<FlawBox> {
    while boxes.len() > 1 {
        let Some((i, j)) = first_overlapping_pair(&boxes) else {
            break;
        };
        boxes[i] = boxes[i].union(&boxes[j]);
        boxes.remove(j);
    }
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_pair_intersects(boxes: &[FlawBox]) -> bool {
        first_overlapping_pair(boxes).is_none()
    }

    #[test]
    fn merges_overlapping_pair_and_keeps_disjoint_box() {
        let merged = merge(vec![
            FlawBox::new(0, 0, 20, 20),
            FlawBox::new(15, 15, 20, 20),
            FlawBox::new(100, 100, 10, 10),
        ]);
        assert_eq!(
            merged,
            vec![FlawBox::new(0, 0, 35, 35), FlawBox::new(100, 100, 10, 10)]
        );
    }

    #[test]
    fn union_can_cascade_into_further_merges() {
        // b only overlaps a after a has absorbed c.
        let a = FlawBox::new(0, 0, 10, 10);
        let b = FlawBox::new(30, 30, 10, 10);
        let c = FlawBox::new(5, 5, 30, 30);
        let merged = merge(vec![a, b, c]);
        assert_eq!(merged, vec![FlawBox::new(0, 0, 40, 40)]);
    }

    #[test]
    fn first_pair_wins_over_larger_overlap() {
        let boxes = vec![
            FlawBox::new(0, 0, 10, 10),
            FlawBox::new(9, 9, 10, 10),
            FlawBox::new(100, 0, 10, 10),
            FlawBox::new(101, 1, 10, 10),
        ];
        assert_eq!(first_overlapping_pair(&boxes), Some((0, 1)));
        let merged = merge(boxes);
        assert_eq!(
            merged,
            vec![FlawBox::new(0, 0, 19, 19), FlawBox::new(100, 0, 11, 11)]
        );
    }

    #[test]
    fn touching_boxes_stay_separate() {
        let boxes = vec![FlawBox::new(0, 0, 10, 10), FlawBox::new(10, 0, 10, 10)];
        assert_eq!(merge(boxes.clone()), boxes);
    }

    #[test]
    fn trivial_inputs_pass_through() {
        assert!(merge(Vec::new()).is_empty());
        let one = vec![FlawBox::new(3, 3, 3, 3)];
        assert_eq!(merge(one.clone()), one);
    }

    #[test]
    fn merge_is_idempotent_and_leaves_no_overlaps() {
        let lists = vec![
            vec![
                FlawBox::new(0, 0, 50, 10),
                FlawBox::new(40, 5, 10, 40),
                FlawBox::new(200, 200, 5, 5),
                FlawBox::new(45, 40, 30, 30),
            ],
            vec![
                FlawBox::new(10, 10, 5, 5),
                FlawBox::new(20, 20, 5, 5),
                FlawBox::new(30, 30, 5, 5),
                FlawBox::new(0, 0, 100, 100),
            ],
            vec![FlawBox::new(1, 1, 1, 1), FlawBox::new(5, 5, 1, 1)],
        ];
        for list in lists {
            let len = list.len();
            let once = merge(list);
            assert!(once.len() <= len);
            assert!(no_pair_intersects(&once), "{once:?}");
            assert_eq!(merge(once.clone()), once);
        }
    }
}
