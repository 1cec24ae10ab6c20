mod sequencer_test;
